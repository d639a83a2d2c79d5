#![no_main]

use eqstream::legacy::LegacyPacket;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Anything that parses must serialize back to the same bytes
    if let Ok(packet) = LegacyPacket::decode(data) {
        assert_eq!(packet.encode(), data);
    }
});
