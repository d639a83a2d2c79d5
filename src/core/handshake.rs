//! Session handshake bodies.
//!
//! Both travel without compression or CRC, all integers big-endian:
//! ```text
//! SessionRequest  [unknown_a(4)] [session_id(4)] [max_length(4)]
//! SessionResponse [session_id(4)] [key(4)] [unknown_a(1)] [format(1)]
//!                 [unknown_b(1)] [max_length(4)] [unknown_d(4)]
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::{ProtocolError, Result};

bitflags! {
    /// Session features announced in the response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct SessionFormat: u8 {
        const COMPRESSED = 0x01;
        const ENCODED    = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    pub unknown_a: u32,
    pub session_id: u32,
    pub max_length: u32,
}

impl SessionRequest {
    pub const SIZE: usize = 12;

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(ProtocolError::truncated(Self::SIZE, src.len()));
        }
        Ok(Self {
            unknown_a: src.get_u32(),
            session_id: src.get_u32(),
            max_length: src.get_u32(),
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.unknown_a);
        dst.put_u32(self.session_id);
        dst.put_u32(self.max_length);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionResponse {
    pub session_id: u32,
    pub key: u32,
    pub unknown_a: u8,
    pub format: SessionFormat,
    pub unknown_b: u8,
    pub max_length: u32,
    pub unknown_d: u32,
}

impl SessionResponse {
    pub const SIZE: usize = 17;

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(ProtocolError::truncated(Self::SIZE, src.len()));
        }
        Ok(Self {
            session_id: src.get_u32(),
            key: src.get_u32(),
            unknown_a: src.get_u8(),
            format: SessionFormat::from_bits_truncate(src.get_u8()),
            unknown_b: src.get_u8(),
            max_length: src.get_u32(),
            unknown_d: src.get_u32(),
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.session_id);
        dst.put_u32(self.key);
        dst.put_u8(self.unknown_a);
        dst.put_u8(self.format.bits());
        dst.put_u8(self.unknown_b);
        dst.put_u32(self.max_length);
        dst.put_u32(self.unknown_d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let req = SessionRequest {
            unknown_a: 2,
            session_id: 0x0102_0304,
            max_length: 512,
        };
        let mut out = Vec::new();
        req.encode(&mut out);
        assert_eq!(out, vec![0, 0, 0, 2, 1, 2, 3, 4, 0, 0, 2, 0]);
        assert_eq!(SessionRequest::decode(&out).unwrap(), req);
    }

    #[test]
    fn test_response_format_bits() {
        let resp = SessionResponse {
            session_id: 7,
            key: 0xdead_beef,
            unknown_a: 2,
            format: SessionFormat::COMPRESSED | SessionFormat::ENCODED,
            unknown_b: 0,
            max_length: 512,
            unknown_d: 0,
        };
        let mut out = Vec::new();
        resp.encode(&mut out);
        assert_eq!(out.len(), SessionResponse::SIZE);
        assert_eq!(out[9], 0x05);
        assert_eq!(SessionResponse::decode(&out).unwrap(), resp);
    }

    #[test]
    fn test_short_request_rejected() {
        assert!(SessionRequest::decode(&[0u8; 11]).is_err());
    }
}
