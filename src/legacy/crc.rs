//! Table-driven CRC-32 for legacy frames.
//!
//! The table is the reflected form of generator polynomial `0x04C11DB7`,
//! evaluated at compile time. A frame's trailer is
//! `generate_crc(0, body)` written big-endian.

/// Reflected generator polynomial.
pub const POLYNOMIAL: u32 = 0xEDB8_8320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Lookup table indexed by the low byte of the running CRC xor the input byte.
pub static CRC_TABLE: [u32; 256] = build_table();

/// Folds `buf` into a CRC starting from `seed`.
///
/// The seed is inverted on entry and the result on exit, so chaining
/// `generate_crc(generate_crc(0, a), b)` equals `generate_crc(0, a ++ b)`.
#[doc(alias = "GenerateCRC")]
pub fn generate_crc(seed: u32, buf: &[u8]) -> u32 {
    let crc = buf.iter().fold(!seed, |crc, &byte| {
        (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u32) & 0xff) as usize]
    });
    !crc
}

/// CRC of `buf` in network byte order, ready to append to a frame.
pub fn crc_trailer(buf: &[u8]) -> [u8; 4] {
    generate_crc(0, buf).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_endpoints() {
        assert_eq!(CRC_TABLE[0], 0);
        assert_eq!(CRC_TABLE[1], 0x7707_3096);
        assert_eq!(CRC_TABLE[128], POLYNOMIAL);
        assert_eq!(CRC_TABLE[255], 0x2D02_EF8D);
    }

    #[test]
    fn test_check_value() {
        assert_eq!(generate_crc(0, b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_matches_crc32fast() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1500).collect();
        assert_eq!(generate_crc(0, &data), crc32fast::hash(&data));
    }

    #[test]
    fn test_seed_chaining() {
        let (a, b) = b"legacy frame body".split_at(6);
        assert_eq!(generate_crc(generate_crc(0, a), b), generate_crc(0, b"legacy frame body"));
    }

    #[test]
    fn test_empty_buffer_returns_seed() {
        assert_eq!(generate_crc(0x1234_5678, &[]), 0x1234_5678);
    }
}
