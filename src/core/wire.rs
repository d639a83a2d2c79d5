//! # Wire Codec
//!
//! Stateless transforms over whole protocol frames: CRC16 trailers,
//! compression flags and the chat cipher.
//!
//! ## Frame layout
//! ```text
//! [Opcode(2)] [Flag(1)?] [Body(N)] [CRC16(2)]
//! ```
//! The flag byte is only present on sessions that negotiated compression.
//! Handshake frames (session request/response, out-of-session) carry neither
//! a flag nor a CRC.
//!
//! The send path is `compress -> chat_encode -> append_crc`; the receive path
//! undoes it in reverse order.

use tracing::trace;

use crate::core::opcodes::is_handshake_opcode;
use crate::error::{ProtocolError, Result};
use crate::utils::compression::{deflate, inflate};

/// Flag byte for a deflated body.
pub const FLAG_COMPRESSED: u8 = 0x5a;
/// Flag byte for a stored body.
pub const FLAG_STORED: u8 = 0xa5;
/// Bodies at or below this size are stored rather than deflated.
pub const COMPRESS_THRESHOLD: usize = 30;
/// Size of the CRC16 trailer.
pub const CRC_SIZE: usize = 2;

/// Keyed CRC16: the low half of a CRC-32 run over the little-endian key
/// followed by `buf`.
pub fn crc16(buf: &[u8], key: u32) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key.to_le_bytes());
    hasher.update(buf);
    (hasher.finalize() & 0xffff) as u16
}

/// Appends the CRC16 trailer in network byte order.
pub fn append_crc(frame: &mut Vec<u8>, key: u32) {
    let crc = crc16(frame, key);
    frame.extend_from_slice(&crc.to_be_bytes());
}

/// Checks the CRC16 trailer of `frame`.
///
/// Handshake frames always pass. An embedded CRC of zero also passes: peers
/// use it to mean "no CRC".
///
/// # Errors
/// `Truncated` when the frame cannot hold a trailer, `CrcMismatch` otherwise
pub fn check_crc(frame: &[u8], key: u32) -> Result<()> {
    if frame.len() >= 2 && is_handshake_opcode(frame[1]) {
        return Ok(());
    }
    if frame.len() < 2 + CRC_SIZE {
        return Err(ProtocolError::truncated(2 + CRC_SIZE, frame.len()));
    }
    let body_len = frame.len() - CRC_SIZE;
    let embedded = u16::from_be_bytes([frame[body_len], frame[body_len + 1]]);
    if embedded == 0 {
        trace!(len = frame.len(), "Frame carries zero CRC, accepting");
        return Ok(());
    }
    let computed = crc16(&frame[..body_len], key);
    if embedded != computed {
        return Err(ProtocolError::CrcMismatch {
            expected: embedded as u32,
            actual: computed as u32,
        });
    }
    Ok(())
}

/// Boolean form of [`check_crc`].
#[inline]
pub fn validate_crc(frame: &[u8], key: u32) -> bool {
    check_crc(frame, key).is_ok()
}

/// Offset of the compression flag: after a two-byte opcode when the frame
/// starts with zero, after a single byte otherwise.
#[inline]
fn flag_offset(frame: &[u8]) -> usize {
    if frame.first() == Some(&0x00) {
        2
    } else {
        1
    }
}

/// Compresses a frame that has no CRC trailer yet.
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if deflate fails
pub fn compress(frame: &[u8]) -> Result<Vec<u8>> {
    let offset = flag_offset(frame);
    if frame.len() < offset {
        return Ok(frame.to_vec());
    }
    let (prefix, body) = frame.split_at(offset);
    let mut out = Vec::with_capacity(frame.len() + 1);
    out.extend_from_slice(prefix);
    if body.len() > COMPRESS_THRESHOLD {
        out.push(FLAG_COMPRESSED);
        out.extend_from_slice(&deflate(body)?);
    } else {
        out.push(FLAG_STORED);
        out.extend_from_slice(body);
    }
    Ok(out)
}

/// Decompresses a frame that still carries its CRC trailer.
///
/// The trailer is carried over unchanged. Frames without a recognised flag
/// (short or pre-compression frames) are copied through.
///
/// # Errors
/// `Truncated` when a deflated frame has no room for its trailer,
/// `DecompressionFailure`/`OversizedPacket` from the inflater
pub fn decompress(frame: &[u8], max_len: usize) -> Result<Vec<u8>> {
    let offset = flag_offset(frame);
    if frame.len() <= 2 {
        return Ok(frame.to_vec());
    }
    match frame[offset] {
        FLAG_COMPRESSED => {
            if frame.len() < offset + 1 + CRC_SIZE {
                return Err(ProtocolError::truncated(offset + 1 + CRC_SIZE, frame.len()));
            }
            let crc_at = frame.len() - CRC_SIZE;
            let inflated = inflate(&frame[offset + 1..crc_at], max_len)?;
            let mut out = Vec::with_capacity(offset + inflated.len() + CRC_SIZE);
            out.extend_from_slice(&frame[..offset]);
            out.extend_from_slice(&inflated);
            out.extend_from_slice(&frame[crc_at..]);
            Ok(out)
        }
        FLAG_STORED => {
            let mut out = Vec::with_capacity(frame.len() - 1);
            out.extend_from_slice(&frame[..offset]);
            out.extend_from_slice(&frame[offset + 1..]);
            Ok(out)
        }
        _ => Ok(frame.to_vec()),
    }
}

/// Frames the chat cipher leaves alone.
#[inline]
fn chat_exempt(frame: &[u8]) -> bool {
    frame.len() < 2 || frame[1] == 0x01 || frame[0] == 0x02 || frame[0] == 0x1d
}

/// Obfuscates everything past the first two bytes, in place.
pub fn chat_encode(frame: &mut [u8], key: u32) {
    if chat_exempt(frame) {
        return;
    }
    let mut key = key;
    let mut words = frame[2..].chunks_exact_mut(4);
    for word in &mut words {
        let cipher = u32::from_le_bytes([word[0], word[1], word[2], word[3]]) ^ key;
        word.copy_from_slice(&cipher.to_le_bytes());
        key = cipher;
    }
    let tail_key = key as u8;
    for byte in words.into_remainder() {
        *byte ^= tail_key;
    }
}

/// Reverses [`chat_encode`] in place.
pub fn chat_decode(frame: &mut [u8], key: u32) {
    if chat_exempt(frame) {
        return;
    }
    let mut key = key;
    let mut words = frame[2..].chunks_exact_mut(4);
    for word in &mut words {
        let cipher = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        word.copy_from_slice(&(cipher ^ key).to_le_bytes());
        key = cipher;
    }
    let tail_key = key as u8;
    for byte in words.into_remainder() {
        *byte ^= tail_key;
    }
}
