#![no_main]

use eqstream::core::wire::{append_crc, compress, decompress};
use eqstream::utils::compression::{inflate, MAX_INFLATED_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw inflate must respect the size limit on malformed streams
    let _ = inflate(data, MAX_INFLATED_SIZE);
    let _ = decompress(data, MAX_INFLATED_SIZE);

    if let Ok(mut wire) = compress(data) {
        append_crc(&mut wire, 0);
        let _ = decompress(&wire, MAX_INFLATED_SIZE);
    }
});
