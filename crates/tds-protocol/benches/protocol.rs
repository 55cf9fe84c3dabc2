//! Benchmarks for packet framing and token parsing.

#![allow(clippy::unwrap_used, missing_docs)]

use bytes::{Bytes, BytesMut};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tds_protocol::{
    ColMetaData, ColumnMeta, Collation, Done, PacketStatus, PacketType, PreLogin, RowData,
    TdsVersion, TokenDispatcher, TokenType, TypeId, assemble, build_packets, encode_sql_batch,
    types::MAX_LENGTH_SENTINEL,
};

fn bench_build_packets(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_packets");
    for size in [64usize, 4096, 64 * 1024] {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}"), |b| {
            b.iter(|| {
                build_packets(
                    PacketType::SqlBatch,
                    PacketStatus::empty(),
                    0,
                    black_box(&payload),
                    1,
                    4096,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_assemble(c: &mut Criterion) {
    let payload = vec![0x5Au8; 64 * 1024];
    let packets = build_packets(
        PacketType::TabularResult,
        PacketStatus::empty(),
        0,
        &payload,
        1,
        4096,
    )
    .unwrap();

    c.bench_function("assemble_64k", |b| {
        b.iter(|| assemble(black_box(&packets)).unwrap())
    });
}

fn bench_prelogin(c: &mut Criterion) {
    let encoded = PreLogin::new().with_instance("SQLEXPRESS").encode();
    c.bench_function("prelogin_decode", |b| {
        b.iter(|| PreLogin::decode(black_box(&encoded)).unwrap())
    });
}

fn bench_sql_batch_encode(c: &mut Criterion) {
    let query = "SELECT id, name, email, created_at FROM users WHERE status = 'active' ORDER BY created_at DESC";
    let mut group = c.benchmark_group("sql_batch_encode");
    group.throughput(Throughput::Bytes(query.len() as u64));
    group.bench_function("medium", |b| b.iter(|| encode_sql_batch(black_box(query))));
    group.finish();
}

fn result_set(rows: usize) -> Bytes {
    let meta = ColMetaData::new(vec![
        ColumnMeta::new("id", TypeId::IntN).with_max_length(4),
        ColumnMeta::new("name", TypeId::NVarChar)
            .with_max_length(200)
            .with_collation(Collation::from_lcid(0x0409)),
        ColumnMeta::new("body", TypeId::NVarChar)
            .with_max_length(MAX_LENGTH_SENTINEL)
            .with_collation(Collation::from_lcid(0x0409)),
    ]);
    let mut buf = BytesMut::new();
    meta.encode(&mut buf);
    let row = RowData {
        values: vec![
            Some(Bytes::from_static(&[1, 0, 0, 0])),
            Some(Bytes::from_static(&[b'a', 0, b'b', 0, b'c', 0])),
            Some(Bytes::from(vec![0x41u8; 512])),
        ],
    };
    for _ in 0..rows {
        row.encode(&mut buf, &meta);
    }
    Done::new(Some(rows as u64)).encode(&mut buf, TokenType::Done, TdsVersion::V7_4);
    buf.freeze()
}

fn bench_token_parse(c: &mut Criterion) {
    let payload = result_set(1000);
    let mut group = c.benchmark_group("token_parse");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("rows_1000", |b| {
        b.iter(|| {
            let mut dispatcher = TokenDispatcher::new(TdsVersion::V7_4);
            dispatcher.parse_all(black_box(payload.clone())).unwrap()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_build_packets,
    bench_assemble,
    bench_prelogin,
    bench_sql_batch_encode,
    bench_token_parse,
);

criterion_main!(benches);
