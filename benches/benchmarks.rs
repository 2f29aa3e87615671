
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use emberdb::{Encoding, Fingerprint, Interval, MemorySeriesStorage, StorageConfig};

fn make_storage(encoding: Encoding) -> MemorySeriesStorage {
    MemorySeriesStorage::new(StorageConfig {
        default_encoding: encoding,
        ..StorageConfig::default()
    })
    .expect("storage init")
}

fn bench_append(c: &mut Criterion) {
    let samples = datasets::generate_samples(datasets::DEFAULT_SEED, 64, 256);
    let mut group = c.benchmark_group("append");
    for (name, encoding) in [
        ("delta", Encoding::Delta),
        ("doubledelta", Encoding::DoubleDelta),
        ("varbit", Encoding::Varbit),
    ] {
        group.bench_function(format!("append_16k_{}", name), |b| {
            b.iter_batched(
                || make_storage(encoding),
                |storage| {
                    for sample in &samples {
                        storage.append_sample(black_box(sample)).expect("append");
                    }
                    storage
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_range_query(c: &mut Criterion) {
    let samples = datasets::generate_samples(datasets::DEFAULT_SEED, 4, 20_000);
    let storage = make_storage(Encoding::DoubleDelta);
    for sample in &samples {
        storage.append_sample(sample).expect("append");
    }
    let fp = Fingerprint::from_metric(&samples[0].metric);
    let last = samples[samples.len() / 4 - 1].timestamp;

    let mut group = c.benchmark_group("query");
    group.bench_function("range_full_series", |b| {
        b.iter(|| {
            let got = storage
                .get_range_values(fp, Interval::new(0, last))
                .expect("range query");
            black_box(got)
        })
    });
    group.bench_function("point_query", |b| {
        b.iter(|| {
            let got = storage
                .get_value_at_time(fp, black_box(last / 2))
                .expect("point query");
            black_box(got)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_append, bench_range_query);
criterion_main!(benches);
