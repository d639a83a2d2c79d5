#![no_main]

use eqstream::core::codec::ProtocolCodec;
use eqstream::core::handshake::SessionFormat;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }
    // First byte picks the session format, next four the key
    let format = SessionFormat::from_bits_truncate(data[0]);
    let key = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let codec = ProtocolCodec::new(key, format, 4096);
    let _ = codec.decode_frame(&data[5..]);
});
