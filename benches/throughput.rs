//! Throughput Benchmark for FlashProxy
//!
//! This benchmark measures the hot paths every forwarded command crosses:
//! request decoding, shard resolution and reply decoding.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashproxy::protocol::{CommandFrame, ReplyDecoder, ReplyFrame, RequestDecoder};
use flashproxy::routing::{ShardTable, SharedShardTable, TopologySnapshot, TopologyUpdater};
use std::thread;
use std::time::Duration;

fn pipeline(commands: usize) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for i in 0..commands {
        CommandFrame::from_parts([
            Bytes::from_static(b"SET"),
            Bytes::from(format!("key:{}", i)),
            Bytes::from("value"),
        ])
        .encode_into(&mut buf);
    }
    buf.to_vec()
}

fn routed_table(sets: u32) -> SharedShardTable {
    let table = SharedShardTable::new(ShardTable::new(1024));
    let snapshot = TopologySnapshot {
        owners: (0..1024).map(|shard| (shard, shard % sets + 1)).collect(),
        sets: (1..=sets)
            .map(|set| (set, vec![format!("10.0.0.{}:7000", set)]))
            .collect(),
    };
    TopologyUpdater::new(table.clone()).load(&snapshot);
    table
}

/// Benchmark request decoding
fn bench_request_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_decode");

    let single = pipeline(1);
    group.throughput(Throughput::Bytes(single.len() as u64));
    group.bench_function("multibulk_single", |b| {
        let mut decoder = RequestDecoder::new();
        b.iter(|| black_box(decoder.decode(&single).unwrap()));
    });

    let batch = pipeline(100);
    group.throughput(Throughput::Elements(100));
    group.bench_function("multibulk_pipeline_100", |b| {
        let mut decoder = RequestDecoder::new();
        b.iter(|| {
            let mut buf = BytesMut::from(&batch[..]);
            while let Some(frame) = decoder.decode_buf(&mut buf).unwrap() {
                black_box(frame);
            }
        });
    });

    // Same pipeline delivered 7 bytes at a time
    group.bench_function("multibulk_fragmented", |b| {
        let mut decoder = RequestDecoder::new();
        b.iter(|| {
            let mut buf = BytesMut::new();
            for chunk in batch.chunks(7) {
                buf.extend_from_slice(chunk);
                while let Some(frame) = decoder.decode_buf(&mut buf).unwrap() {
                    black_box(frame);
                }
            }
        });
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("inline", |b| {
        let mut decoder = RequestDecoder::new();
        b.iter(|| black_box(decoder.decode(b"GET some:key\r\n").unwrap()));
    });

    group.finish();
}

/// Benchmark reply decoding
fn bench_reply_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_decode");
    group.throughput(Throughput::Elements(1));

    let status = ReplyFrame::ok().serialize();
    group.bench_function("status", |b| {
        let mut decoder = ReplyDecoder::new();
        b.iter(|| black_box(decoder.decode(&status).unwrap()));
    });

    let bulk = ReplyFrame::bulk(Bytes::from("x".repeat(1024))).serialize();
    group.bench_function("bulk_1kb", |b| {
        let mut decoder = ReplyDecoder::new();
        b.iter(|| black_box(decoder.decode(&bulk).unwrap()));
    });

    // LRANGE-style reply with nulls and one nested level
    let nested = ReplyFrame::Array(
        (0..100)
            .map(|i| match i % 10 {
                0 => ReplyFrame::null(),
                5 => ReplyFrame::Array(vec![ReplyFrame::Integer(i), ReplyFrame::bulk("inner")]),
                _ => ReplyFrame::bulk(format!("item:{}", i)),
            })
            .collect(),
    )
    .serialize();
    group.bench_function("array_100_nested", |b| {
        let mut decoder = ReplyDecoder::new();
        b.iter(|| black_box(decoder.decode(&nested).unwrap()));
    });

    group.finish();
}

/// Benchmark key -> shard -> server resolution
fn bench_routing(c: &mut Criterion) {
    let table = routed_table(8);

    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(1));

    group.bench_function("shard_of", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("user:{}", i);
            black_box(table.read(|t| t.shard_of(key.as_bytes())));
            i += 1;
        });
    });

    group.bench_function("resolve_hash_tag", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("{{user:{}}}:profile", i % 1000);
            black_box(table.resolve(key.as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark resolution while the topology is being rewritten
fn bench_concurrent_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_readers_1_updater", |b| {
        b.iter(|| {
            let table = routed_table(4);
            let updater = {
                let updater = TopologyUpdater::new(table.clone());
                thread::spawn(move || {
                    for i in 0..1_000u32 {
                        updater.on_shard_owner_changed(i % 1024, i % 4 + 1);
                    }
                })
            };
            let readers: Vec<_> = (0..4)
                .map(|t| {
                    let table = table.clone();
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = format!("key:{}:{}", t, i);
                            black_box(table.resolve(key.as_bytes()));
                        }
                    })
                })
                .collect();

            updater.join().unwrap();
            for handle in readers {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_request_decode,
    bench_reply_decode,
    bench_routing,
    bench_concurrent_routing,
);

criterion_main!(benches);
