//! Protocol encoding/decoding benchmarks.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use wirebus_protocol::codec::decode;
use wirebus_protocol::{Encoder, FrameReader, Message, MAX_PAYLOAD_SIZE};

// One size per length-prefix form: literal, u16 and u32.
const SIZES: [usize; 4] = [100, 1000, 10_000, 100_000];

fn publish(size: usize) -> Message {
    Message::publish(42, Bytes::from(vec![b'x'; size]))
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let encoder = Encoder::new(MAX_PAYLOAD_SIZE);

    for size in SIZES {
        let message = publish(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            let mut buf = BytesMut::with_capacity(message.encoded_len());
            b.iter(|| {
                buf.clear();
                encoder.encode_into(message, &mut buf).unwrap();
                black_box(buf.len())
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in SIZES {
        let encoded = publish(size).encode(MAX_PAYLOAD_SIZE).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(decode(&mut buf, MAX_PAYLOAD_SIZE).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_control_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_frames");
    group.throughput(Throughput::Elements(1));

    let frames = [
        ("ping", Message::ping()),
        ("subscribe", Message::subscribe("orders.eu-west.fills")),
        ("ack", Message::ack(42, u64::MAX)),
    ];
    for (name, message) in frames {
        let encoded = message.encode(MAX_PAYLOAD_SIZE).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", name), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(decode(&mut buf, MAX_PAYLOAD_SIZE).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_frame_reader(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("frame_reader");

    // A burst of small frames, as a busy subscriber would read them.
    let mut stream = BytesMut::new();
    for i in 0..100u16 {
        stream.extend_from_slice(
            &Message::deliver(i, Bytes::from(vec![b'm'; 64]))
                .encode(MAX_PAYLOAD_SIZE)
                .unwrap(),
        );
    }
    let stream = stream.freeze();

    group.throughput(Throughput::Elements(100));
    group.bench_function("100x64B", |b| {
        b.to_async(&rt).iter(|| {
            let stream = stream.clone();
            async move {
                let mut reader = FrameReader::new(&stream[..], MAX_PAYLOAD_SIZE);
                let mut count = 0;
                while let Some(message) = reader.read_message().await.unwrap() {
                    black_box(message);
                    count += 1;
                }
                count
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_control_frames,
    bench_frame_reader,
);

criterion_main!(benches);
