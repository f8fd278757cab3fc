//! The session protocol core: a framed, checksummed, sequenced message
//! protocol with a per-peer sliding-window reliability layer, carried over a
//! TCP byte stream.

pub mod buffer;
pub mod channel;
pub mod crc;
pub mod endpoint;
pub mod frame;
pub mod shared;
