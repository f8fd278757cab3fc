//! Per-peer reliability channel.
//!
//! A `Channel` owns one TCP stream and the sliding-window state for that
//! peer: outbound sequencing with an unacknowledged-send window, inbound
//! deduplication and reordering, cumulative ACKs, NACK-driven and
//! timer-driven retransmission, and the byte buffers between the socket and
//! the frame codec.
//!
//! The application layer sees DATA payloads in strictly increasing sequence
//! order with no gaps and no duplicates, within one session.

use crate::buffer::{Buffer, Ingress};
use crate::frame::{DecodeError, Frame, MessageKind, PacketKind};
use crate::shared::{ClientId, ErrorType, NetworkError, NetworkResult, Seq, SERVER_ID};
use bosun::logging;
use hashbrown::HashMap;
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::net::Shutdown;
use std::time::{Duration, Instant};

const READ_BUF_SIZE: usize = 64 * 1024;
const WRITE_BUF_SIZE: usize = 512 * 1024;

/// Retransmission backoff: the delay starts at `initial` and doubles on
/// every timer-driven resend, saturating at `ceiling`. A covering ACK
/// resets the schedule.
#[derive(Debug, Copy, Clone)]
pub struct RetransmitConfig {
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RetransmitConfig {
    fn default() -> RetransmitConfig {
        RetransmitConfig {
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(5),
        }
    }
}

/// Reliability state and transport plumbing for a single peer.
pub struct Channel {
    id: ClientId,
    stream: Option<TcpStream>,

    /// Next sequence to assign to an outbound DATA frame.
    send_seq: Seq,
    /// Next in-order sequence expected from the peer.
    recv_seq: Seq,
    /// DATA frames sent but not yet covered by an ACK, in send order
    /// (send order is sequence order, so the front is always the oldest).
    unacked: VecDeque<(Seq, Frame)>,
    /// DATA frames received ahead of `recv_seq`, keyed by raw sequence.
    reorder: HashMap<u16, Frame>,

    read_buffer: Buffer,
    write_buffer: Buffer,
    /// In-order application frames awaiting dispatch.
    inbound: VecDeque<Frame>,

    last_ingress: Instant,

    retransmit: RetransmitConfig,
    retransmit_at: Option<Instant>,
    retransmit_delay: Duration,

    log: logging::Logger,
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        id: ClientId,
        retransmit: RetransmitConfig,
        now: Instant,
        log: L,
    ) -> Channel {
        let channel_log = match log.into() {
            Some(log) => log.new(logging::o!("channel_id" => id)),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Channel {
            id,
            stream: None,
            send_seq: Seq::ZERO,
            recv_seq: Seq::ZERO,
            unacked: VecDeque::new(),
            reorder: HashMap::new(),
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            inbound: VecDeque::new(),
            last_ingress: now,
            retransmit_delay: retransmit.initial,
            retransmit,
            retransmit_at: None,
            log: channel_log,
        }
    }

    /// Attaches the transport. Must be called exactly once, before the
    /// channel is pumped.
    #[inline]
    pub fn open(&mut self, stream: TcpStream) {
        debug_assert!(self.stream.is_none(), "Channel already has a stream");
        self.stream = Some(stream);
    }

    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[inline]
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Time elapsed since the peer last delivered bytes.
    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }

    /// True if buffered outbound bytes are waiting for the transport.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Drains the in-order application frames delivered so far.
    #[inline]
    pub fn drain_inbound(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.inbound.drain(..)
    }

    /// Reads everything the transport has, then decodes and routes as many
    /// complete frames as arrived. Returns `Fatal(Closed)` once the peer
    /// has shut down its end.
    pub fn receive(&mut self, now: Instant) -> NetworkResult<()> {
        let stream = self.stream.as_mut().expect("Channel must have a stream");

        let outcome = self.read_buffer.ingress(stream)?;

        match outcome {
            Ingress::Data(received) => {
                if received > 0 {
                    self.last_ingress = now;
                }
                self.process(now)
            }
            Ingress::Closed(received) => {
                if received > 0 {
                    self.last_ingress = now;
                    self.process(now)?;
                }
                Err(NetworkError::Fatal(ErrorType::Closed))
            }
        }
    }

    /// Sends all buffered outbound data the transport will take.
    pub fn flush(&mut self) -> NetworkResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_mut().expect("Channel must have a stream");
        Ok(self.write_buffer.egress(stream)?)
    }

    /// Sequences and queues one application frame for the peer.
    pub fn send_data(
        &mut self,
        now: Instant,
        message: MessageKind,
        expected: MessageKind,
        payload: &str,
    ) -> NetworkResult<Seq> {
        let frame = Frame::new(self.send_seq, PacketKind::Data, message, expected, SERVER_ID, payload);

        self.enqueue_wire(&frame)?;
        self.unacked.push_back((frame.seq, frame));
        self.send_seq = self.send_seq.next();

        // Arm the resend schedule for the oldest outstanding frame.
        if self.retransmit_at.is_none() {
            self.retransmit_at = Some(now + self.retransmit_delay);
        }

        logging::trace!(self.log, "queued data frame";
                        "seq" => self.send_seq.prev().0,
                        "unacked" => self.unacked.len());

        Ok(self.send_seq.prev())
    }

    /// Resends every outstanding frame when the retransmission deadline has
    /// passed without a covering ACK, doubling the delay up to the ceiling.
    pub fn housekeep(&mut self, now: Instant) -> NetworkResult<()> {
        if let Some(deadline) = self.retransmit_at {
            if deadline <= now && !self.unacked.is_empty() {
                logging::debug!(self.log, "retransmission timer expired";
                                "unacked" => self.unacked.len(),
                                "delay_ms" => self.retransmit_delay.as_millis() as u64);

                self.retransmit_all()?;
                self.retransmit_delay = (self.retransmit_delay * 2).min(self.retransmit.ceiling);
                self.retransmit_at = Some(now + self.retransmit_delay);
            }
        }

        Ok(())
    }

    /// Closes the channel and the underlying stream. When `notify` is set a
    /// best-effort DISCONNECT frame is flushed out first.
    pub fn close(&mut self, notify: bool, now: Instant) {
        logging::debug!(self.log, "closing channel";
                        "notify" => notify,
                        "send_seq" => self.send_seq.0,
                        "recv_seq" => self.recv_seq.0,
                        "unacked" => self.unacked.len());

        if notify && self.stream.is_some() {
            drop(self.send_data(now, MessageKind::Disconnect, MessageKind::Disconnect, "disconnected"));
            drop(self.flush());
        }

        if let Some(stream) = self.stream.take() {
            drop(stream.shutdown(Shutdown::Both));
        }
    }

    /// Decodes every complete frame in the read buffer and routes it.
    fn process(&mut self, now: Instant) -> NetworkResult<()> {
        loop {
            match Frame::decode(self.read_buffer.as_slice()) {
                Ok((frame, consumed)) => {
                    self.read_buffer.consume(consumed);
                    self.route(frame, now)?;
                }
                Err(DecodeError::ShortFrame) => break,
                Err(DecodeError::ChecksumMismatch) => {
                    // The stream resynchronizes at the next frame boundary
                    // the peer writes; anything discarded here comes back
                    // via the NACK-driven resend.
                    logging::warn!(self.log, "checksum mismatch, requesting retransmission";
                                   "discarded" => self.read_buffer.len());
                    self.enqueue_control(PacketKind::Nack, Seq::ZERO)?;
                    self.read_buffer.clear();
                    break;
                }
            }
        }

        Ok(())
    }

    fn route(&mut self, frame: Frame, now: Instant) -> NetworkResult<()> {
        match frame.packet {
            PacketKind::Data => self.handle_data(frame),
            PacketKind::Ack => {
                self.handle_ack(frame.seq, now);
                Ok(())
            }
            PacketKind::Nack => {
                logging::debug!(self.log, "peer requested retransmission";
                                "unacked" => self.unacked.len());
                self.retransmit_all()
            }
        }
    }

    fn handle_data(&mut self, frame: Frame) -> NetworkResult<()> {
        let seq = frame.seq;

        if seq == self.recv_seq {
            self.deliver(frame);

            // Pull in any buffered frames that are now contiguous.
            while let Some(next) = self.reorder.remove(&self.recv_seq.0) {
                self.deliver(next);
            }
        } else if seq.lt(self.recv_seq) {
            logging::trace!(self.log, "duplicate frame discarded"; "seq" => seq.0);
        } else {
            logging::trace!(self.log, "future frame buffered";
                            "seq" => seq.0,
                            "expecting" => self.recv_seq.0);
            self.reorder.entry(seq.0).or_insert(frame);
        }

        // Cumulative acknowledgement: everything before `recv_seq` has been
        // delivered upward, whichever of the three cases ran.
        self.enqueue_control(PacketKind::Ack, self.recv_seq.prev())
    }

    fn deliver(&mut self, frame: Frame) {
        self.inbound.push_back(frame);
        self.recv_seq = self.recv_seq.next();
    }

    /// An ACK for `acked` retires every outstanding frame up to and
    /// including it.
    fn handle_ack(&mut self, acked: Seq, now: Instant) {
        let mut covered = 0;

        while let Some(&(seq, _)) = self.unacked.front() {
            if !seq.le(acked) {
                break;
            }
            self.unacked.pop_front();
            covered += 1;
        }

        if covered > 0 {
            logging::trace!(self.log, "ack received";
                            "acked" => acked.0,
                            "covered" => covered,
                            "outstanding" => self.unacked.len());

            // Progress was made, so the backoff starts over.
            self.retransmit_delay = self.retransmit.initial;
            self.retransmit_at = if self.unacked.is_empty() {
                None
            } else {
                Some(now + self.retransmit_delay)
            };
        }
    }

    /// Resends everything in the send window, oldest first, with the
    /// original sequence numbers.
    fn retransmit_all(&mut self) -> NetworkResult<()> {
        for (_, frame) in &self.unacked {
            let wire = frame.encode();
            self.write_buffer
                .push(&wire)
                .map_err(|_| NetworkError::Fatal(ErrorType::BufferOverrun))?;
        }

        Ok(())
    }

    /// Control frames are not sequenced into the send window; their seq
    /// field is informational.
    fn enqueue_control(&mut self, packet: PacketKind, seq: Seq) -> NetworkResult<()> {
        let frame = Frame::new(seq, packet, MessageKind::Text, MessageKind::Text, SERVER_ID, "");
        self.enqueue_wire(&frame)
    }

    fn enqueue_wire(&mut self, frame: &Frame) -> NetworkResult<()> {
        self.write_buffer
            .push(&frame.encode())
            .map_err(|_| NetworkError::Fatal(ErrorType::BufferOverrun))
    }
}
