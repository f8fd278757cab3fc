//! Frame layout and the encode/decode rules.
//!
//! Wire layout, most significant bit first:
//!
//! ```text
//! offset  size  field
//! 0       4     crc32 over bytes [4..9+len]
//! 4       2     seq (big-endian u16)
//! 6       1     flags: [packet_kind:2][message_kind:3][expected_kind:3]
//! 7       1     [sender_id:7][msg_len_hi:1]
//! 8       1     msg_len_lo (low 8 bits of the 9-bit length)
//! 9       N     payload, 0 <= N <= 511
//! ```

use crate::crc;
use crate::shared::{ClientId, Seq};
use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 9;
pub const MAX_PAYLOAD: usize = 511;
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketKind {
    Data = 0,
    Ack = 1,
    Nack = 2,
}

impl PacketKind {
    #[inline]
    fn from_bits(bits: u8) -> Option<PacketKind> {
        match bits {
            0 => Some(PacketKind::Data),
            1 => Some(PacketKind::Ack),
            2 => Some(PacketKind::Nack),
            _ => None,
        }
    }
}

/// Application message kinds. The same domain serves both the `msg_type`
/// field and the advisory `expected_type` field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageKind {
    Disconnect = 0,
    Connect = 1,
    Text = 2,
    Chat = 3,
    Board = 4,
    Place = 5,
    Fire = 6,
    Result = 7,
}

impl MessageKind {
    /// Total over the 3-bit domain.
    #[inline]
    fn from_bits(bits: u8) -> MessageKind {
        match bits & 0x7 {
            0 => MessageKind::Disconnect,
            1 => MessageKind::Connect,
            2 => MessageKind::Text,
            3 => MessageKind::Chat,
            4 => MessageKind::Board,
            5 => MessageKind::Place,
            6 => MessageKind::Fire,
            7 => MessageKind::Result,
            _ => unreachable!(),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// Not enough buffered bytes for a complete frame; wait for more.
    ShortFrame,
    /// The frame is corrupt: stored and computed CRC disagree, or the flag
    /// bits name no packet kind.
    ChecksumMismatch,
}

/// One self-contained protocol unit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub seq: Seq,
    pub packet: PacketKind,
    pub message: MessageKind,
    /// The reply kind the sender anticipates. Advisory metadata only.
    pub expected: MessageKind,
    pub sender: ClientId,
    pub payload: String,
}

impl Frame {
    #[inline]
    pub fn new(
        seq: Seq,
        packet: PacketKind,
        message: MessageKind,
        expected: MessageKind,
        sender: ClientId,
        payload: impl Into<String>,
    ) -> Frame {
        Frame {
            seq,
            packet,
            message,
            expected,
            sender,
            payload: payload.into(),
        }
    }

    /// Serializes the frame. Payloads longer than 511 bytes are truncated at
    /// the nearest character boundary below the limit.
    pub fn encode(&self) -> Vec<u8> {
        let mut cut = self.payload.len().min(MAX_PAYLOAD);
        while !self.payload.is_char_boundary(cut) {
            cut -= 1;
        }
        let payload = &self.payload.as_bytes()[..cut];
        let msg_len = payload.len();

        let mut wire = vec![0u8; HEADER_SIZE + msg_len];
        BigEndian::write_u16(&mut wire[4..6], self.seq.0);
        wire[6] = ((self.packet as u8) << 6) | ((self.message as u8) << 3) | self.expected as u8;
        wire[7] = (self.sender << 1) | ((msg_len >> 8) as u8 & 1);
        wire[8] = (msg_len & 0xFF) as u8;
        wire[HEADER_SIZE..].copy_from_slice(payload);

        let crc = crc::checksum(&wire[4..]);
        BigEndian::write_u32(&mut wire[..4], crc);

        wire
    }

    /// Parses one frame from the front of `buffer`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(buffer: &[u8]) -> Result<(Frame, usize), DecodeError> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::ShortFrame);
        }

        let msg_len = (((buffer[7] & 1) as usize) << 8) | buffer[8] as usize;
        let total = HEADER_SIZE + msg_len;

        if buffer.len() < total {
            return Err(DecodeError::ShortFrame);
        }

        let stored = BigEndian::read_u32(&buffer[..4]);
        if stored != crc::checksum(&buffer[4..total]) {
            return Err(DecodeError::ChecksumMismatch);
        }

        // The CRC passed, so reserved packet-kind bits mean the sender is
        // not speaking this protocol; treat the frame as corrupt.
        let packet = PacketKind::from_bits(buffer[6] >> 6).ok_or(DecodeError::ChecksumMismatch)?;

        let frame = Frame {
            seq: Seq(BigEndian::read_u16(&buffer[4..6])),
            packet,
            message: MessageKind::from_bits(buffer[6] >> 3),
            expected: MessageKind::from_bits(buffer[6]),
            sender: buffer[7] >> 1,
            payload: decode_payload(&buffer[HEADER_SIZE..total]),
        };

        Ok((frame, total))
    }
}

/// Payloads are nominally UTF-8, but a decoder never fails on bytes: invalid
/// sequences degrade to a latin-1 reading of the whole payload.
fn decode_payload(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SERVER_ID;

    fn sample() -> Frame {
        Frame::new(
            Seq(42),
            PacketKind::Data,
            MessageKind::Fire,
            MessageKind::Result,
            7,
            "B5",
        )
    }

    #[test]
    fn test_roundtrip() {
        let frame = sample();
        let wire = frame.encode();

        assert_eq!(wire.len(), HEADER_SIZE + 2);

        let (decoded, consumed) = Frame::decode(&wire).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let frame = Frame::new(
            Seq(0),
            PacketKind::Ack,
            MessageKind::Text,
            MessageKind::Text,
            SERVER_ID,
            "",
        );
        let wire = frame.encode();

        assert_eq!(wire.len(), HEADER_SIZE);
        assert_eq!(Frame::decode(&wire).unwrap().0, frame);
    }

    #[test]
    fn test_roundtrip_extreme_field_values() {
        let frame = Frame::new(
            Seq(0xFFFF),
            PacketKind::Nack,
            MessageKind::Result,
            MessageKind::Disconnect,
            127,
            "x".repeat(MAX_PAYLOAD),
        );

        let wire = frame.encode();
        assert_eq!(wire.len(), MAX_FRAME_SIZE);
        assert_eq!(Frame::decode(&wire).unwrap().0, frame);
    }

    #[test]
    fn test_short_buffer_waits() {
        let wire = sample().encode();

        for cut in 0..wire.len() {
            assert_eq!(Frame::decode(&wire[..cut]).unwrap_err(), DecodeError::ShortFrame);
        }
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let wire = sample().encode();

        for byte in 0..wire.len() {
            for bit in 0..8 {
                let mut corrupt = wire.clone();
                corrupt[byte] ^= 1 << bit;
                // A flip in the length field can also leave the buffer too
                // short to contain the claimed payload.
                match Frame::decode(&corrupt) {
                    Err(DecodeError::ChecksumMismatch) | Err(DecodeError::ShortFrame) => (),
                    other => panic!("corrupt frame accepted: {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_payload_truncated_to_limit() {
        let mut frame = sample();
        frame.payload = "y".repeat(MAX_PAYLOAD + 100);

        let wire = frame.encode();
        assert_eq!(wire.len(), MAX_FRAME_SIZE);

        let (decoded, _) = Frame::decode(&wire).unwrap();
        assert_eq!(decoded.payload, "y".repeat(MAX_PAYLOAD));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut frame = sample();
        // 2-byte characters: 511 bytes would split one down the middle.
        frame.payload = "é".repeat(300);

        let wire = frame.encode();
        let (decoded, _) = Frame::decode(&wire).unwrap();

        assert_eq!(decoded.payload, "é".repeat(255));
    }

    #[test]
    fn test_invalid_utf8_degrades_to_latin1() {
        let mut wire = sample().encode();
        // Overwrite the two payload bytes with latin-1 "õ!" and refresh the
        // checksum so only the text encoding is at fault.
        wire[HEADER_SIZE] = 0xF5;
        wire[HEADER_SIZE + 1] = 0x21;
        let crc = crc::checksum(&wire[4..]);
        byteorder::BigEndian::write_u32(&mut wire[..4], crc);

        let (decoded, _) = Frame::decode(&wire).unwrap();
        assert_eq!(decoded.payload, "õ!");
    }

    #[test]
    fn test_reserved_packet_bits_rejected() {
        let mut wire = sample().encode();
        wire[6] |= 0b1100_0000;
        let crc = crc::checksum(&wire[4..]);
        byteorder::BigEndian::write_u32(&mut wire[..4], crc);

        assert_eq!(Frame::decode(&wire).unwrap_err(), DecodeError::ChecksumMismatch);
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let first = sample();
        let second = Frame::new(
            Seq(43),
            PacketKind::Data,
            MessageKind::Chat,
            MessageKind::Text,
            7,
            "hello",
        );

        let mut wire = first.encode();
        wire.extend(second.encode());

        let (decoded, consumed) = Frame::decode(&wire).unwrap();
        assert_eq!(decoded, first);

        let (decoded, _) = Frame::decode(&wire[consumed..]).unwrap();
        assert_eq!(decoded, second);
    }
}
