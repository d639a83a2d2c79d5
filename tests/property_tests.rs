//! Property-based tests using proptest
//!
//! These tests check codec invariants across randomly generated frames and
//! keys, including inputs no well-behaved peer would send.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use eqstream::core::codec::ProtocolCodec;
use eqstream::core::handshake::SessionFormat;
use eqstream::core::opcodes::{read_app_opcode, write_app_opcode, OpcodeWidth, OP_PACKET};
use eqstream::core::packet::ProtocolPacket;
use eqstream::core::wire::{append_crc, chat_decode, chat_encode, compress, decompress, validate_crc};
use eqstream::legacy::{FragmentInfo, LegacyPacket};
use eqstream::utils::compression::{deflate, inflate, MAX_INFLATED_SIZE};
use proptest::prelude::*;

// Property: compression is undone exactly once the CRC trailer is attached
proptest! {
    #[test]
    fn prop_compress_roundtrip(body in prop::collection::vec(any::<u8>(), 0..2000), key in any::<u32>()) {
        let mut frame = vec![0x00, 0x09];
        frame.extend_from_slice(&body);

        let mut wire = compress(&frame).unwrap();
        append_crc(&mut wire, key);
        let restored = decompress(&wire, MAX_INFLATED_SIZE).unwrap();

        prop_assert_eq!(&restored[..restored.len() - 2], frame.as_slice());
    }
}

// Property: the chat cipher is its own inverse for a fixed key
proptest! {
    #[test]
    fn prop_chat_cipher_roundtrip(body in prop::collection::vec(any::<u8>(), 0..600), key in any::<u32>()) {
        let mut frame = vec![0x00, 0x09];
        frame.extend_from_slice(&body);
        let original = frame.clone();

        chat_encode(&mut frame, key);
        chat_decode(&mut frame, key);

        prop_assert_eq!(frame, original);
    }
}

// Property: a freshly appended CRC always validates
proptest! {
    #[test]
    fn prop_appended_crc_validates(body in prop::collection::vec(any::<u8>(), 0..512), key in any::<u32>()) {
        let mut frame = vec![0x00, 0x09];
        frame.extend_from_slice(&body);
        append_crc(&mut frame, key);

        prop_assert!(validate_crc(&frame, key));
    }
}

// Property: every session format decodes what it encodes
proptest! {
    #[test]
    fn prop_codec_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..400),
        key in any::<u32>(),
        bits in 0u8..8,
    ) {
        let format = SessionFormat::from_bits_truncate(bits);
        let codec = ProtocolCodec::new(key, format, MAX_INFLATED_SIZE);
        let packet = ProtocolPacket::from_vec(OP_PACKET, payload);

        let frame = codec.encode_frame(&packet).unwrap();
        prop_assert_eq!(codec.decode_frame(&frame).unwrap(), packet);
    }
}

// Property: decoding arbitrary bytes never panics
proptest! {
    #[test]
    fn prop_decoders_never_panic(data in prop::collection::vec(any::<u8>(), 0..300), key in any::<u32>()) {
        let codec = ProtocolCodec::new(key, SessionFormat::all(), 4096);
        let _ = codec.decode_frame(&data);
        let _ = LegacyPacket::decode(&data);
        let _ = decompress(&data, 4096);
        let _ = inflate(&data, 4096);
    }
}

// Property: two-byte application opcodes survive the zero escape
proptest! {
    #[test]
    fn prop_app_opcode_roundtrip(op in any::<u16>()) {
        let mut out = Vec::new();
        let written = write_app_opcode(op, OpcodeWidth::Two, &mut out);

        prop_assert_eq!(read_app_opcode(&out, OpcodeWidth::Two).unwrap(), (op, written));
    }
}

// Property: zlib roundtrip preserves data
proptest! {
    #[test]
    fn prop_zlib_roundtrip(data in prop::collection::vec(any::<u8>(), 0..20000)) {
        let compressed = deflate(&data).expect("Compression should not fail");
        let decompressed = inflate(&compressed, MAX_INFLATED_SIZE).expect("Decompression should not fail");

        prop_assert_eq!(decompressed, data);
    }
}

// Property: legacy frames re-encode to the same bytes
proptest! {
    #[test]
    fn prop_legacy_reencode(
        seq in any::<u16>(),
        opcode in any::<u16>(),
        extra in prop::collection::vec(any::<u8>(), 0..300),
        arq in prop::option::of(any::<u16>()),
        fragment in prop::option::of((any::<u16>(), 1u16..8)),
    ) {
        let mut packet = LegacyPacket::message(seq, opcode, &extra);
        if let Some(arq) = arq {
            packet = packet.request_ack(arq);
        }
        if let Some((fragment_seq, total)) = fragment {
            packet = packet.with_fragment(FragmentInfo { sequence: fragment_seq, current: 0, total });
        }

        let wire = packet.encode();
        let decoded = LegacyPacket::decode(&wire).unwrap();
        prop_assert_eq!(decoded.encode(), wire);
        prop_assert_eq!(decoded.opcode, Some(opcode));
        prop_assert_eq!(decoded.extra, extra);
    }
}
