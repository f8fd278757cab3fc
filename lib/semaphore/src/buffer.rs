//! Byte FIFO between a stream transport and the frame codec. Data is
//! appended at the tail and consumed from the head.

use bytes::{Buf, BytesMut};
use std::io;

/// Outcome of draining a readable transport into the buffer.
#[derive(Debug, Eq, PartialEq)]
pub enum Ingress {
    /// Bytes read; the transport would now block.
    Data(usize),
    /// Bytes read up to an orderly end-of-stream from the peer.
    Closed(usize),
}

pub struct Buffer {
    data: BytesMut,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(limit.min(4096)),
            limit,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - self.data.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drops `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Appends bytes at the tail, failing once the buffer limit is reached.
    pub fn push(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > self.free_capacity() {
            return Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"));
        }

        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads from the transport until it would block or signals end of
    /// stream. A zero-byte read is surfaced as `Ingress::Closed` so the
    /// caller can run its disconnect path instead of spinning.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<Ingress> {
        let mut chunk = [0u8; 4096];
        let mut received = 0;

        loop {
            if self.free_capacity() == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"));
            }

            let want = chunk.len().min(self.free_capacity());

            match reader.read(&mut chunk[..want]) {
                Ok(0) => return Ok(Ingress::Closed(received)),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    received += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Ingress::Data(received));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes buffered data to the transport until drained or it would
    /// block, advancing past what was accepted.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut sent = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.data.advance(count);
                    sent += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(sent)
    }
}
