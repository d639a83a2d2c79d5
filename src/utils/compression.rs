use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{ProtocolError, Result};

/// Default ceiling on inflated output, well above any single datagram.
pub const MAX_INFLATED_SIZE: usize = 64 * 1024;

/// Deflates `data` into a zlib stream.
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if the encoder fails
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::best());
    encoder
        .write_all(data)
        .map_err(|_| ProtocolError::CompressionFailure)?;
    encoder.finish().map_err(|_| ProtocolError::CompressionFailure)
}

/// Inflates a zlib stream, refusing to produce more than `max_len` bytes.
///
/// The limit is checked per chunk so a small malicious stream cannot expand
/// into an unbounded allocation.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` on a corrupt stream and
/// `ProtocolError::OversizedPacket` when the output would exceed `max_len`
pub fn inflate(data: &[u8], max_len: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(max_len));
    let mut buffer = [0u8; 4096];
    loop {
        match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if out.len() + n > max_len {
                    return Err(ProtocolError::OversizedPacket { limit: max_len });
                }
                out.extend_from_slice(&buffer[..n]);
            }
            Err(_) => return Err(ProtocolError::DecompressionFailure),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zlib_roundtrip() {
        let original = b"Hello, World! This is a test of zlib compression for datagrams.";
        let compressed = deflate(original).unwrap();
        let decompressed = inflate(&compressed, MAX_INFLATED_SIZE).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zlib_header_present() {
        let compressed = deflate(&[0u8; 64]).unwrap();
        // CMF byte for deflate with a 32K window
        assert_eq!(compressed[0], 0x78);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_inflate_size_limit_enforcement() {
        let compressed = deflate(&vec![0u8; 10_000]).unwrap();
        let result = inflate(&compressed, 1_000);
        assert!(matches!(
            result,
            Err(ProtocolError::OversizedPacket { limit: 1_000 })
        ));
    }

    #[test]
    fn test_malformed_stream_rejected() {
        let result = inflate(&[0x78, 0xda, 0xff, 0xff, 0xff, 0x00], MAX_INFLATED_SIZE);
        assert!(result.is_err(), "Should reject malformed zlib data");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_empty_input_roundtrip() {
        let compressed = deflate(&[]).unwrap();
        assert!(inflate(&compressed, MAX_INFLATED_SIZE).unwrap().is_empty());
    }
}
