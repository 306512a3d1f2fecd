//! Packet Ring Benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sase_hyper::{BackPressure, Capabilities, CopyPath, PacketHeader, PacketRing};

fn bench_write_read_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_write_read_release");

    for size in [64usize, 512, 1500] {
        let packet = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));

        for path in [CopyPath::Vectorized, CopyPath::Scalar] {
            let ring = PacketRing::with_policy(1024, 2048, BackPressure::Drop, path).unwrap();
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", path), size),
                &packet,
                |b, packet| {
                    b.iter(|| {
                        ring.push(black_box(packet), PacketHeader::at(0)).unwrap();
                        let handle = ring.read().unwrap();
                        ring.release(handle).unwrap();
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_batch_drain(c: &mut Criterion) {
    let ring = PacketRing::new(1024, 2048).unwrap();
    let packet = [0u8; 64];
    let mut handles = Vec::with_capacity(64);

    let mut group = c.benchmark_group("ring_batch");
    group.throughput(Throughput::Elements(64));
    group.bench_function("fill_drain_64", |b| {
        b.iter(|| {
            for i in 0..64 {
                ring.push(&packet, PacketHeader::at(i)).unwrap();
            }
            handles.clear();
            ring.read_batch(64, &mut handles);
            for handle in handles.drain(..) {
                ring.release(handle).unwrap();
            }
        })
    });
    group.finish();
}

fn bench_capability_detect(c: &mut Criterion) {
    c.bench_function("capabilities_detect_cached", |b| {
        b.iter(|| black_box(Capabilities::detect()))
    });
}

criterion_group!(
    benches,
    bench_write_read_release,
    bench_batch_drain,
    bench_capability_detect
);
criterion_main!(benches);
