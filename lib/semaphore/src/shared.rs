use std::io;
use std::net;

/// 7-bit peer id carried in every frame header. Id 0 is reserved for the
/// server; connected peers get ids from [1, 127].
pub type ClientId = u8;

pub const SERVER_ID: ClientId = 0;
pub const MAX_CLIENTS: usize = 127;

/// 16-bit frame sequence number, wrapping modulo 2^16.
///
/// Orderings are half-window modular: a sequence compares as smaller than
/// another when it lies within the 32768 values behind it. Naive `<` breaks
/// once a long-lived channel wraps.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Seq(pub u16);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    /// The sequence following this one.
    #[inline]
    pub fn next(self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }

    /// The sequence preceding this one.
    #[inline]
    pub fn prev(self) -> Seq {
        Seq(self.0.wrapping_sub(1))
    }

    #[inline]
    pub fn lt(self, other: Seq) -> bool {
        self != other && self.le(other)
    }

    #[inline]
    pub fn le(self, other: Seq) -> bool {
        other.0.wrapping_sub(self.0) < 0x8000
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// No fatal condition, but the operation cannot progress until the peer
    /// sends or drains more data.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// The peer closed its end of the stream.
    Closed,
    /// The ingestion buffer filled without containing a complete frame.
    BufferOverrun,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetworkError::Wait))
    }
}
