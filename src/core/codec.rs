//! Per-session envelope codec.
//!
//! Applies a session's negotiated format on top of the stateless transforms in
//! [`crate::core::wire`]. Encoding compresses, then ciphers, then appends the
//! CRC; decoding checks the CRC first and undoes the rest in reverse.
//! Handshake opcodes bypass all of it.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::handshake::SessionFormat;
use crate::core::opcodes::is_handshake_opcode;
use crate::core::packet::ProtocolPacket;
use crate::core::wire::{
    append_crc, chat_decode, chat_encode, check_crc, compress, decompress, CRC_SIZE,
};
use crate::error::{ProtocolError, Result};
use crate::utils::compression::MAX_INFLATED_SIZE;

/// Datagram codec for protocol envelopes of one session.
///
/// Each `decode` call consumes the whole buffer as a single datagram; there is
/// no stream framing on UDP.
#[derive(Debug, Clone)]
pub struct ProtocolCodec {
    key: u32,
    format: SessionFormat,
    max_decompressed: usize,
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self::handshake()
    }
}

impl ProtocolCodec {
    pub fn new(key: u32, format: SessionFormat, max_decompressed: usize) -> Self {
        Self {
            key,
            format,
            max_decompressed,
        }
    }

    /// Codec for a session that has not negotiated a key yet.
    pub fn handshake() -> Self {
        Self::new(0, SessionFormat::empty(), MAX_INFLATED_SIZE)
    }

    /// Applies the key and format announced in the session response.
    pub fn set_session(&mut self, key: u32, format: SessionFormat) {
        self.key = key;
        self.format = format;
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn format(&self) -> SessionFormat {
        self.format
    }

    /// Serializes, compresses, obfuscates and checksums one envelope.
    pub fn encode_frame(&self, packet: &ProtocolPacket) -> Result<Vec<u8>> {
        let mut frame = packet.to_bytes();
        if packet.opcode <= 0xff && is_handshake_opcode(packet.opcode as u8) {
            return Ok(frame);
        }
        if self.format.contains(SessionFormat::COMPRESSED) {
            frame = compress(&frame)?;
        }
        if self.format.contains(SessionFormat::ENCODED) {
            chat_encode(&mut frame, self.key);
        }
        append_crc(&mut frame, self.key);
        Ok(frame)
    }

    /// Verifies and unwraps one datagram into an envelope.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<ProtocolPacket> {
        if frame.len() < 2 {
            return Err(ProtocolError::truncated(2, frame.len()));
        }
        if is_handshake_opcode(frame[1]) {
            return ProtocolPacket::from_bytes(frame);
        }
        check_crc(frame, self.key)?;

        let mut buf = frame.to_vec();
        if self.format.contains(SessionFormat::ENCODED) {
            let body_len = buf.len() - CRC_SIZE;
            chat_decode(&mut buf[..body_len], self.key);
        }
        if self.format.contains(SessionFormat::COMPRESSED) {
            buf = decompress(&buf, self.max_decompressed)?;
        }
        buf.truncate(buf.len().saturating_sub(CRC_SIZE));
        ProtocolPacket::from_bytes(&buf)
    }
}

impl Decoder for ProtocolCodec {
    type Item = ProtocolPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        self.decode_frame(&datagram).map(Some)
    }
}

impl Encoder<ProtocolPacket> for ProtocolCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ProtocolPacket, dst: &mut BytesMut) -> Result<()> {
        let frame = self.encode_frame(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
