use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shmbus::channel::Channel;
use shmbus::shm::Backing;

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_write");
    for size in [64usize, 1024, 64 * 1024] {
        let ch = Channel::open("bench_write", "bench_write", 10 * 1024 * 1024, Backing::Private)
            .unwrap();
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| ch.write(black_box(&payload)).unwrap())
        });
    }
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_roundtrip");
    for size in [64usize, 1024, 64 * 1024] {
        let ch = Channel::open(
            "bench_roundtrip",
            "bench_roundtrip",
            10 * 1024 * 1024,
            Backing::Private,
        )
        .unwrap();
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            let mut cursor = ch.cursor();
            b.iter(|| {
                ch.write(black_box(&payload)).unwrap();
                black_box(ch.read_next(&mut cursor).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_conflate(c: &mut Criterion) {
    let ch = Channel::open("bench_conflate", "bench_conflate", 1024 * 1024, Backing::Private)
        .unwrap();
    let payload = vec![0xE7u8; 1024];
    c.bench_function("channel_conflate_1KiB_burst8", |b| {
        let mut cursor = ch.cursor();
        b.iter(|| {
            for _ in 0..8 {
                ch.write(black_box(&payload)).unwrap();
            }
            black_box(ch.read_latest(&mut cursor).unwrap())
        })
    });
}

criterion_group!(benches, bench_write, bench_roundtrip, bench_conflate);
criterion_main!(benches);
