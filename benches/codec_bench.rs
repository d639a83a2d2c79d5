use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use eqstream::core::codec::ProtocolCodec;
use eqstream::core::handshake::SessionFormat;
use eqstream::core::opcodes::OP_PACKET;
use eqstream::core::packet::ProtocolPacket;
use eqstream::legacy::LegacyPacket;
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_protocol_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol_codec");
    let payload_sizes = [16usize, 128, 480];
    let formats = [
        ("plain", SessionFormat::empty()),
        ("compressed", SessionFormat::COMPRESSED),
        ("full", SessionFormat::COMPRESSED | SessionFormat::ENCODED),
    ];

    for &size in &payload_sizes {
        let payload: Vec<u8> = (0..size).map(|i| (i % 17) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        for (name, format) in formats {
            group.bench_function(format!("encode_{name}_{size}b"), |b| {
                let mut codec = ProtocolCodec::new(0xdead_beef, format, 64 * 1024);
                b.iter_batched(
                    || ProtocolPacket::new(OP_PACKET, &payload),
                    |packet| {
                        let mut buf = BytesMut::with_capacity(size + 16);
                        codec.encode(packet, &mut buf).unwrap();
                    },
                    BatchSize::SmallInput,
                )
            });
            group.bench_function(format!("decode_{name}_{size}b"), |b| {
                let mut codec = ProtocolCodec::new(0xdead_beef, format, 64 * 1024);
                let frame = codec
                    .encode_frame(&ProtocolPacket::new(OP_PACKET, &payload))
                    .unwrap();
                b.iter(|| {
                    let mut buf = BytesMut::from(frame.as_slice());
                    let decoded = codec.decode(&mut buf).unwrap().unwrap();
                    assert_eq!(decoded.payload.len(), size);
                })
            });
        }
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_legacy_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("legacy_frames");

    for &size in &[16usize, 128, 480] {
        let packet = LegacyPacket::message(42, 0x4600, &vec![7u8; size]).request_ack(3);
        let wire = packet.encode();
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_function(format!("encode_{size}b"), |b| b.iter(|| packet.encode()));
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter(|| LegacyPacket::decode(&wire).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_protocol_codec, bench_legacy_frames);
criterion_main!(benches);
