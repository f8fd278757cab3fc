//! Connection management: the accept loop, the client id pool and registry,
//! and the poll-driven pumping of every channel.
//!
//! The endpoint is application-agnostic. It turns socket readiness into
//! decoded, deduplicated, in-order application frames tagged with the
//! originating client id, and exposes `send` for the layer above; who gets
//! told what is the game's business.

use crate::channel::{Channel, RetransmitConfig};
use crate::frame::{Frame, MessageKind, PacketKind};
use crate::shared::{ClientId, ErrorUtils, NetworkResult, Seq, MAX_CLIENTS, SERVER_ID};
use bosun::logging;
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

const REFUSAL_TEXT: &str = "Server is full, try again later.";

/// Describes a change in the connectivity of a peer since the last drain.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionChange {
    Connected(ClientId),
    Disconnected(ClientId),
}

pub struct Endpoint {
    listener: TcpListener,
    poll: Poll,
    events: Events,

    channels: HashMap<ClientId, Channel>,
    /// Available ids in [1, 127]; the smallest is handed out first.
    free_ids: BinaryHeap<Reverse<ClientId>>,
    /// Connected ids in accept order.
    live: IndexSet<ClientId>,

    changes: Vec<ConnectionChange>,
    inbound: Vec<(ClientId, Frame)>,

    retransmit: RetransmitConfig,
    log: logging::Logger,
}

impl Endpoint {
    /// Binds the listener to `address` (`<host>:<port>`) and prepares the
    /// id pool. `max_clients` bounds the pool and is capped by the 7-bit id
    /// space.
    pub fn new(
        address: &str,
        max_clients: usize,
        retransmit: RetransmitConfig,
        log: &logging::Logger,
    ) -> NetworkResult<Endpoint> {
        let addr: SocketAddr = address.parse()?;
        let pool_size = max_clients.min(MAX_CLIENTS);

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let endpoint = Endpoint {
            listener,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            channels: HashMap::new(),
            free_ids: (1..=pool_size as ClientId).map(Reverse).collect(),
            live: IndexSet::new(),
            changes: Vec::new(),
            inbound: Vec::new(),
            retransmit,
            log: log.new(logging::o!()),
        };

        logging::info!(endpoint.log, "listening"; "address" => %endpoint.local_addr());

        Ok(endpoint)
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("Listener must have a local address")
    }

    #[inline]
    pub fn client_count(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn is_connected(&self, id: ClientId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Time since the peer last delivered bytes, if it is connected.
    #[inline]
    pub fn last_ingress_elapsed(&self, id: ClientId, now: Instant) -> Option<Duration> {
        self.channels.get(&id).map(|channel| channel.last_ingress_elapsed(now))
    }

    /// Drains the connection changes accumulated since the last call.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    /// Drains the in-order application frames received since the last call.
    #[inline]
    pub fn take_inbound(&mut self) -> Vec<(ClientId, Frame)> {
        std::mem::take(&mut self.inbound)
    }

    /// Waits up to `timeout` for transport readiness, then accepts pending
    /// connections, pumps every ready channel, and runs retransmission
    /// housekeeping.
    pub fn sync(&mut self, now: Instant, timeout: Duration) {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => panic!("Transport poll failed: {}", err),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER_TOKEN {
                self.accept_pending(now);
            } else {
                self.pump(token.0 as ClientId, readable, writable, now);
            }
        }

        self.housekeeping(now);
    }

    /// Queues one application frame for a peer and flushes what the
    /// transport will take immediately.
    pub fn send(&mut self, id: ClientId, message: MessageKind, expected: MessageKind, payload: &str, now: Instant) {
        let failed = match self.channels.get_mut(&id) {
            Some(channel) => {
                channel.send_data(now, message, expected, payload).has_failed()
                    || channel.flush().has_failed()
            }
            None => return,
        };

        if failed {
            logging::warn!(self.log, "send failed, dropping peer"; "client_id" => id);
            self.close(id, false, now);
        }
    }

    /// Disconnects a peer: deregisters and shuts down the stream, returns
    /// the id to the pool and records the change.
    pub fn close(&mut self, id: ClientId, notify: bool, now: Instant) {
        let mut channel = match self.channels.remove(&id) {
            Some(channel) => channel,
            None => return,
        };

        if let Some(stream) = channel.stream_mut() {
            drop(self.poll.registry().deregister(stream));
        }
        channel.close(notify, now);

        self.live.shift_remove(&id);
        self.free_ids.push(Reverse(id));
        self.changes.push(ConnectionChange::Disconnected(id));

        logging::info!(self.log, "client disconnected";
                       "client_id" => id,
                       "connected" => self.channels.len());
    }

    /// Disconnects every peer. Used on shutdown and when a match is
    /// forfeited.
    pub fn close_all(&mut self, notify: bool, now: Instant) {
        let ids: Vec<ClientId> = self.live.iter().copied().collect();
        for id in ids {
            self.close(id, notify, now);
        }
    }

    fn accept_pending(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr, now),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, addr: SocketAddr, now: Instant) {
        let id = match self.free_ids.pop() {
            Some(Reverse(id)) => id,
            None => {
                // Registry exhausted: a one-frame refusal, then the door.
                logging::warn!(self.log, "refusing connection, id pool exhausted"; "peer" => %addr);
                let refusal = Frame::new(
                    Seq::ZERO,
                    PacketKind::Data,
                    MessageKind::Text,
                    MessageKind::Text,
                    SERVER_ID,
                    REFUSAL_TEXT,
                );
                drop(stream.write(&refusal.encode()));
                return;
            }
        };

        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, Token(id as usize), Interest::READABLE | Interest::WRITABLE)
        {
            logging::error!(self.log, "stream registration failed"; "error" => %err);
            self.free_ids.push(Reverse(id));
            return;
        }

        let mut channel = Channel::new(id, self.retransmit, now, &self.log);
        channel.open(stream);

        self.channels.insert(id, channel);
        self.live.insert(id);
        self.changes.push(ConnectionChange::Connected(id));

        logging::info!(self.log, "client connected";
                       "client_id" => id,
                       "peer" => %addr,
                       "connected" => self.channels.len());
    }

    fn pump(&mut self, id: ClientId, readable: bool, writable: bool, now: Instant) {
        let (frames, failed) = match self.channels.get_mut(&id) {
            Some(channel) => {
                let mut failed = false;

                if readable {
                    failed = channel.receive(now).has_failed();
                }
                if !failed && writable {
                    failed = channel.flush().has_failed();
                }

                // Frames decoded ahead of a failure still count; the peer
                // delivered them before going away.
                (channel.drain_inbound().collect::<Vec<_>>(), failed)
            }
            // A stale token from an event raced with a close.
            None => return,
        };

        self.inbound.extend(frames.into_iter().map(|frame| (id, frame)));

        if failed {
            self.close(id, false, now);
        }
    }

    /// Retransmission deadlines and pending flushes for every live channel.
    fn housekeeping(&mut self, now: Instant) {
        let ids: Vec<ClientId> = self.live.iter().copied().collect();

        for id in ids {
            let failed = match self.channels.get_mut(&id) {
                Some(channel) => {
                    channel.housekeep(now).has_failed()
                        || (channel.has_egress() && channel.flush().has_failed())
                }
                None => continue,
            };

            if failed {
                self.close(id, false, now);
            }
        }
    }
}
