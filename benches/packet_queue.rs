use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use voicebridge::audio::{OverflowPolicy, PacketQueue, QueueConfig};
use voicebridge::protocol::EncodedPacket;

fn packet() -> EncodedPacket {
    EncodedPacket::new(Bytes::from(vec![0x5a; 80]))
}

fn push_pop(c: &mut Criterion) {
    let queue = PacketQueue::new(&QueueConfig::default());
    c.bench_function("push_pop", |b| {
        b.iter(|| {
            queue.push(packet());
            black_box(queue.pop_or_none());
        })
    });
}

fn overflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("overflow");
    for policy in [OverflowPolicy::DropOldest, OverflowPolicy::DropNewest] {
        group.bench_function(format!("{:?}", policy), |b| {
            b.iter_batched(
                || {
                    let queue = PacketQueue::new(&QueueConfig::bounded(50, policy));
                    for _ in 0..50 {
                        queue.push(packet());
                    }
                    queue
                },
                |queue| {
                    for _ in 0..50 {
                        black_box(queue.push(packet()));
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn drain_empty(c: &mut Criterion) {
    let queue = PacketQueue::new(&QueueConfig::default());
    c.bench_function("pop_empty", |b| b.iter(|| black_box(queue.pop_or_none())));
}

criterion_group!(benches, push_pop, overflow, drain_empty);
criterion_main!(benches);
