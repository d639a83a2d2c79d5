//! Legacy frame parser and serializer.
//!
//! Optional fields appear in a fixed order selected by [`LegacyFlags`]. A
//! decoded frame re-encodes to the same bytes.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::legacy::crc::{crc_trailer, generate_crc};

/// Shortest frame worth parsing: header word, sequence, one 2-byte field, CRC.
pub const MIN_FRAME_SIZE: usize = 10;
/// Shortest frame that can hold a fragment triple.
pub const MIN_FRAGMENT_FRAME_SIZE: usize = 16;
/// Size of the CRC-32 trailer.
pub const CRC_SIZE: usize = 4;

bitflags! {
    /// Legacy header word. The first wire byte holds the low eight bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct LegacyFlags: u16 {
        const UNKNOWN_A0          = 0x0001;
        const ACK_REQUEST         = 0x0002;
        const CLOSING_A           = 0x0004;
        const FRAGMENT            = 0x0008;
        const ACK_SEQUENCE        = 0x0010;
        const SEQ_START           = 0x0020;
        const CLOSING_B           = 0x0040;
        const SEQ_END             = 0x0080;
        const SPECIAL_ACK_REQUEST = 0x0100;
        const UNKNOWN_B1          = 0x0200;
        const ACK_RESPONSE        = 0x0400;
        /// One trailing reserved byte; frames carrying it are dumped.
        const RESERVED_1          = 0x0800;
        const RESERVED_2          = 0x1000;
        const RESERVED_4          = 0x2000;
        const RESERVED_8          = 0x4000;
        const UNKNOWN_B7          = 0x8000;
    }
}

impl LegacyFlags {
    /// Both closing bits: the peer is tearing the session down.
    pub fn is_closing(self) -> bool {
        self.contains(LegacyFlags::CLOSING_A | LegacyFlags::CLOSING_B)
    }
}

/// Position of one frame inside a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentInfo {
    pub sequence: u16,
    pub current: u16,
    pub total: u16,
}

/// Ack-sequence field: one byte alone, two bytes when an ack-request is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckSequence {
    Low(u8),
    Pair { high: u8, low: u8 },
}

/// One decoded legacy frame.
///
/// `flags` decides which optional fields exist on the wire; `decode` keeps the
/// two in step and constructors below do the same.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LegacyPacket {
    pub flags: LegacyFlags,
    pub sequence: u16,
    pub ack_response: Option<u16>,
    pub reserved_1: Option<u8>,
    pub reserved_2: Option<[u8; 2]>,
    pub reserved_4: Option<[u8; 4]>,
    pub reserved_8: Option<[u8; 8]>,
    pub ack_request: Option<u16>,
    pub fragment: Option<FragmentInfo>,
    pub ack_sequence: Option<AckSequence>,
    pub opcode: Option<u16>,
    pub extra: Vec<u8>,
    /// Set when the frame used rarely seen header bits.
    pub worth_dumping: bool,
}

fn need(src: &[u8], n: usize, what: &'static str) -> Result<()> {
    if src.remaining() < n {
        return Err(ProtocolError::InvalidHeader(what));
    }
    Ok(())
}

fn take<const N: usize>(src: &mut &[u8], what: &'static str) -> Result<[u8; N]> {
    need(src, N, what)?;
    let mut out = [0u8; N];
    src.copy_to_slice(&mut out);
    Ok(out)
}

impl LegacyPacket {
    /// Data frame carrying a whole message.
    pub fn message(sequence: u16, opcode: u16, extra: &[u8]) -> Self {
        Self {
            sequence,
            opcode: Some(opcode),
            extra: extra.to_vec(),
            ..Self::default()
        }
    }

    /// Pure acknowledgement of `acked`.
    pub fn ack(sequence: u16, acked: u16) -> Self {
        Self {
            flags: LegacyFlags::ACK_RESPONSE,
            sequence,
            ack_response: Some(acked),
            ..Self::default()
        }
    }

    /// Asks the peer to acknowledge this frame.
    pub fn request_ack(mut self, arq: u16) -> Self {
        self.flags |= LegacyFlags::ACK_REQUEST;
        self.ack_request = Some(arq);
        self
    }

    /// Marks this frame as one piece of a fragmented message.
    pub fn with_fragment(mut self, fragment: FragmentInfo) -> Self {
        self.flags |= LegacyFlags::FRAGMENT;
        self.fragment = Some(fragment);
        if fragment.current != 0 {
            self.opcode = None;
        }
        self
    }

    /// Frame with no opcode and no payload.
    pub fn is_pure_ack(&self) -> bool {
        self.opcode.is_none() && self.extra.is_empty()
    }

    pub fn is_first_fragment(&self) -> bool {
        self.fragment.map_or(true, |f| f.current == 0)
    }

    /// Parses a frame and checks its CRC-32 trailer.
    #[doc(alias = "DecodePacket")]
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < MIN_FRAME_SIZE {
            return Err(ProtocolError::truncated(MIN_FRAME_SIZE, frame.len()));
        }
        let (body, trailer) = frame.split_at(frame.len() - CRC_SIZE);
        let embedded = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = generate_crc(0, body);
        if embedded != computed {
            return Err(ProtocolError::CrcMismatch {
                expected: embedded,
                actual: computed,
            });
        }

        let mut src = body;
        let flags = LegacyFlags::from_bits_retain(src.get_u16_le());
        let mut packet = LegacyPacket {
            flags,
            sequence: src.get_u16(),
            ..Self::default()
        };

        if flags.contains(LegacyFlags::ACK_RESPONSE) {
            packet.ack_response = Some(u16::from_be_bytes(take(&mut src, "ack response")?));
        }
        if flags.contains(LegacyFlags::RESERVED_1) {
            packet.reserved_1 = Some(take::<1>(&mut src, "reserved byte")?[0]);
            packet.worth_dumping = true;
        }
        if flags.contains(LegacyFlags::RESERVED_2) {
            packet.reserved_2 = Some(take(&mut src, "reserved word")?);
        }
        if flags.contains(LegacyFlags::RESERVED_4) {
            packet.reserved_4 = Some(take(&mut src, "reserved dword")?);
        }
        if flags.contains(LegacyFlags::RESERVED_8) {
            packet.reserved_8 = Some(take(&mut src, "reserved qword")?);
        }
        if flags.contains(LegacyFlags::ACK_REQUEST) {
            packet.ack_request = Some(u16::from_be_bytes(take(&mut src, "ack request")?));
        }
        if flags.contains(LegacyFlags::FRAGMENT) {
            if frame.len() < MIN_FRAGMENT_FRAME_SIZE {
                return Err(ProtocolError::truncated(MIN_FRAGMENT_FRAME_SIZE, frame.len()));
            }
            need(src, 6, "fragment info")?;
            packet.fragment = Some(FragmentInfo {
                sequence: src.get_u16(),
                current: src.get_u16(),
                total: src.get_u16(),
            });
        }
        if flags.contains(LegacyFlags::ACK_SEQUENCE) {
            packet.ack_sequence = Some(if flags.contains(LegacyFlags::ACK_REQUEST) {
                let [high, low] = take(&mut src, "ack sequence")?;
                AckSequence::Pair { high, low }
            } else {
                AckSequence::Low(take::<1>(&mut src, "ack sequence")?[0])
            });
        }
        if src.has_remaining() && !flags.is_closing() && packet.is_first_fragment() {
            packet.opcode = Some(u16::from_le_bytes(take(&mut src, "opcode")?));
        }
        packet.extra = src.to_vec();

        if packet.is_pure_ack() {
            trace!(seq = packet.sequence, "Pure ack frame");
        }
        Ok(packet)
    }

    /// Serializes the frame and appends its CRC-32 trailer.
    #[doc(alias = "ReturnPacket")]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.extra.len());
        out.put_u16_le(self.flags.bits());
        out.put_u16(self.sequence);
        if let Some(arsp) = self.ack_response {
            out.put_u16(arsp);
        }
        if let Some(b) = self.reserved_1 {
            out.put_u8(b);
        }
        if let Some(bytes) = self.reserved_2 {
            out.put_slice(&bytes);
        }
        if let Some(bytes) = self.reserved_4 {
            out.put_slice(&bytes);
        }
        if let Some(bytes) = self.reserved_8 {
            out.put_slice(&bytes);
        }
        if let Some(arq) = self.ack_request {
            out.put_u16(arq);
        }
        if let Some(frag) = self.fragment {
            out.put_u16(frag.sequence);
            out.put_u16(frag.current);
            out.put_u16(frag.total);
        }
        match self.ack_sequence {
            Some(AckSequence::Pair { high, low }) => {
                out.put_u8(high);
                out.put_u8(low);
            }
            Some(AckSequence::Low(low)) => out.put_u8(low),
            None => {}
        }
        if let Some(op) = self.opcode {
            out.put_u16_le(op);
        }
        out.put_slice(&self.extra);
        let trailer = crc_trailer(&out);
        out.put_slice(&trailer);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pure_ack_layout() {
        let frame = LegacyPacket::ack(7, 3).encode();
        assert_eq!(&frame[..6], &[0x00, 0x04, 0x00, 0x07, 0x00, 0x03]);
        assert_eq!(frame.len(), 10);
        let decoded = LegacyPacket::decode(&frame).unwrap();
        assert!(decoded.is_pure_ack());
        assert_eq!(decoded.ack_response, Some(3));
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            LegacyPacket::decode(&[0u8; 9]),
            Err(ProtocolError::Truncated { needed: 10, .. })
        ));
    }

    #[test]
    fn test_corrupt_trailer_rejected() {
        let mut frame = LegacyPacket::message(1, 0x2001, b"hi").encode();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(
            LegacyPacket::decode(&frame),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_reserved_byte_marks_dump() {
        let packet = LegacyPacket {
            flags: LegacyFlags::RESERVED_1 | LegacyFlags::ACK_RESPONSE,
            sequence: 1,
            ack_response: Some(1),
            reserved_1: Some(0x42),
            ..LegacyPacket::default()
        };
        let decoded = LegacyPacket::decode(&packet.encode()).unwrap();
        assert!(decoded.worth_dumping);
        assert_eq!(decoded.reserved_1, Some(0x42));
    }

    #[test]
    fn test_later_fragment_has_no_opcode() {
        let packet = LegacyPacket {
            extra: vec![1, 2, 3, 4],
            ..LegacyPacket::default()
        }
        .with_fragment(FragmentInfo {
            sequence: 9,
            current: 1,
            total: 2,
        });
        let decoded = LegacyPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.opcode, None);
        assert_eq!(decoded.extra, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fragment_flag_on_short_frame_rejected() {
        // 12 bytes with a valid CRC but the fragment flag set
        let mut body = vec![0x08, 0x00, 0x00, 0x01, 0xaa, 0xbb, 0xcc, 0xdd];
        let trailer = crc_trailer(&body);
        body.extend_from_slice(&trailer);
        assert!(matches!(
            LegacyPacket::decode(&body),
            Err(ProtocolError::Truncated { needed: 16, .. })
        ));
    }
}
