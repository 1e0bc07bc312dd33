use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use hybridlog::device::NullDisk;
use hybridlog::hlog::FixedSizeHandler;
use hybridlog::{LightEpoch, LogAllocator, LogConfig};

fn bench_allocate(c: &mut Criterion) {
    let config = LogConfig {
        page_size_bits: 20,
        buffer_size: 64,
        ..LogConfig::default()
    };
    let log = LogAllocator::new(
        config,
        Arc::new(LightEpoch::new()),
        Arc::new(NullDisk),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();

    c.bench_function("allocate_24b", |b| {
        b.iter(|| {
            // The null device completes flushes inline, so the ring recycles
            // without stalling; retry defensively anyway.
            loop {
                if let Ok(address) = log.allocate(black_box(24)) {
                    return black_box(address);
                }
                log.epoch().drain();
            }
        })
    });
}

fn bench_translate(c: &mut Criterion) {
    let log = LogAllocator::new(
        LogConfig::default(),
        Arc::new(LightEpoch::new()),
        Arc::new(NullDisk),
        None,
        FixedSizeHandler::<u64, u64>::new(),
    )
    .unwrap();
    let address = log.allocate(24).unwrap();

    c.bench_function("physical_address", |b| {
        b.iter(|| black_box(log.physical_address(black_box(address))))
    });
}

criterion_group!(benches, bench_allocate, bench_translate);
criterion_main!(benches);
