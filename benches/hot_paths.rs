//! Hot path benchmarks for the packet path.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! Every client packet goes through header decode, the codec and the
//! dispatcher's queue insert before a worker dequeues it, so these
//! dominate per-request overhead.

use bytes::{BufMut, BytesMut};
use conn_server::connection::{ConnStatus, ConnectionEntry};
use conn_server::dispatch::queue_frame;
use conn_server::protocol::{Frame, NetHeader, PacketCodec, HEADER_SIZE};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use futures::executor::block_on;
use std::time::Duration;
use tokio_util::codec::Decoder;

fn encoded(header: NetHeader, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf
}

/// Benchmark NetHeader::decode - runs once per packet
fn bench_header_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_decode");
    group.throughput(Throughput::Elements(1));

    let command = encoded(NetHeader::command(42, 7, 128), &[]);
    group.bench_function("command", |b| {
        b.iter(|| NetHeader::decode(black_box(&command[..])))
    });

    let data = encoded(NetHeader::data(42, 0).with_invalidate_snapshot(true), &[]);
    group.bench_function("data_with_flags", |b| {
        b.iter(|| NetHeader::decode(black_box(&data[..])))
    });

    group.finish();
}

/// Benchmark PacketCodec::decode for header-only and payload packets
fn bench_codec_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_decode");

    for size in [0usize, 64, 1024, 16 * 1024] {
        let payload = vec![b'x'; size];
        let wire = encoded(NetHeader::data(1, size as u32), &payload);
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_function(format!("data_{}", size), |b| {
            let mut codec = PacketCodec::default();
            b.iter(|| {
                let mut src = wire.clone();
                codec.decode(black_box(&mut src))
            })
        });
    }

    group.finish();
}

/// Benchmark a command plus its data frame through queue_frame, then the
/// worker-side dequeue
fn bench_dispatch_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_receive");
    group.throughput(Throughput::Elements(1));

    for size in [16usize, 1024] {
        let payload = BytesMut::from(&vec![b'y'; size][..]);

        group.bench_function(format!("command_and_data_{}", size), |b| {
            let conn = ConnectionEntry::new(0, 64);
            conn.with_lock(|c| c.status = ConnStatus::Open);
            b.iter(|| {
                queue_frame(&conn, Frame::header_only(NetHeader::command(9, 3, size as u32)));
                queue_frame(&conn, Frame::new(NetHeader::data(9, size as u32), payload.clone()));
                let header = conn.receive_command();
                let data = block_on(conn.receive_data(9, Some(Duration::ZERO)));
                black_box((header, data))
            })
        });
    }

    group.bench_function("abort_purge", |b| {
        let conn = ConnectionEntry::new(0, 64);
        conn.with_lock(|c| c.status = ConnStatus::Open);
        b.iter(|| {
            for rid in 1..=8u16 {
                queue_frame(&conn, Frame::header_only(NetHeader::command(rid, 3, 0)));
            }
            conn.remove_all_unexpected_packets();
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_header_decode,
    bench_codec_decode,
    bench_dispatch_receive,
);

criterion_main!(benches);
