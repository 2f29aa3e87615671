//! End-to-end scenarios against the public storage surface: point and
//! range queries, label intersection, chunk overflow, and the pin/evict
//! lifecycle.

use emberdb::eviction::EvictionArbiter;
use emberdb::{
    noop_event_listener, Chunk, ChunkDesc, Encoding, Fingerprint, Interval, LabelSet,
    MemorySeriesStorage, Sample, SamplePair, StorageConfig, EARLIEST,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn pair(timestamp: i64, value: f64) -> SamplePair {
    SamplePair { timestamp, value }
}

fn append(storage: &MemorySeriesStorage, metric: &LabelSet, timestamp: i64, value: f64) {
    storage
        .append_sample(&Sample {
            metric: metric.clone(),
            timestamp,
            value,
        })
        .unwrap();
}

#[test]
fn append_and_point_query() {
    let storage = MemorySeriesStorage::new(StorageConfig::default()).unwrap();
    let metric = labels(&[("job", "a")]);
    let fp = Fingerprint::from_metric(&metric);
    append(&storage, &metric, 100, 1.0);
    append(&storage, &metric, 200, 2.0);
    append(&storage, &metric, 300, 3.0);

    assert_eq!(storage.get_value_at_time(fp, 200).unwrap(), vec![pair(200, 2.0)]);
    assert_eq!(
        storage.get_value_at_time(fp, 150).unwrap(),
        vec![pair(100, 1.0), pair(200, 2.0)]
    );
    assert_eq!(storage.get_value_at_time(fp, 50).unwrap(), vec![pair(100, 1.0)]);
    assert_eq!(storage.get_value_at_time(fp, 400).unwrap(), vec![pair(300, 3.0)]);
}

#[test]
fn range_and_boundary_queries() {
    let storage = MemorySeriesStorage::new(StorageConfig::default()).unwrap();
    let metric = labels(&[("job", "a")]);
    let fp = Fingerprint::from_metric(&metric);
    for (t, v) in [(100, 1.0), (200, 2.0), (300, 3.0)] {
        append(&storage, &metric, t, v);
    }

    assert_eq!(
        storage.get_range_values(fp, Interval::new(150, 250)).unwrap(),
        vec![pair(200, 2.0)]
    );
    assert_eq!(
        storage.get_boundary_values(fp, Interval::new(150, 250)).unwrap(),
        vec![pair(200, 2.0)]
    );
    assert_eq!(
        storage.get_range_values(fp, Interval::new(100, 300)).unwrap(),
        vec![pair(100, 1.0), pair(200, 2.0), pair(300, 3.0)]
    );
    assert_eq!(
        storage.get_boundary_values(fp, Interval::new(100, 300)).unwrap(),
        vec![pair(100, 1.0), pair(300, 3.0)]
    );
}

#[test]
fn append_ordering_survives_chunk_overflow() {
    let storage = MemorySeriesStorage::new(StorageConfig::default()).unwrap();
    let metric = labels(&[("job", "bulk")]);
    let fp = Fingerprint::from_metric(&metric);
    let count = 50_000i64;
    for i in 0..count {
        append(&storage, &metric, i * 1000, (i % 13) as f64);
    }
    assert!(storage.resident_chunks() > 1, "series should span chunks");

    let all = storage
        .get_range_values(fp, Interval::new(i64::MIN, i64::MAX))
        .unwrap();
    assert_eq!(all.len(), count as usize);
    for w in all.windows(2) {
        assert!(w[0].timestamp < w[1].timestamp);
    }
}

#[test]
fn overflow_populates_predecessor_last_time() {
    let resident = Arc::new(AtomicUsize::new(0));
    let mut first = Chunk::new(Encoding::Delta).add(pair(0, 0.0)).unwrap();
    let desc = ChunkDesc::new(first.pop().unwrap(), resident);
    let mut t = 0i64;
    let overflow = loop {
        t += 1;
        let overflow = desc.add(pair(t, t as f64)).unwrap();
        if !overflow.is_empty() {
            break overflow;
        }
    };
    desc.maybe_populate_last_time().unwrap();
    assert_eq!(overflow.len(), 1);
    assert!(overflow[0].first_time() > desc.first_time());
    let last = desc.last_time().unwrap();
    assert_ne!(last, EARLIEST);
    assert!(last < overflow[0].first_time());
}

#[test]
fn label_set_intersection_selects_exactly_one_series() {
    let storage = MemorySeriesStorage::new(StorageConfig::default()).unwrap();
    let m1 = labels(&[("job", "a"), ("env", "p")]);
    let m2 = labels(&[("job", "a"), ("env", "q")]);
    let m3 = labels(&[("job", "b"), ("env", "p")]);
    append(&storage, &m1, 1, 1.0);
    append(&storage, &m2, 1, 1.0);
    append(&storage, &m3, 1, 1.0);

    let got = storage
        .get_fingerprints_for_label_set(&labels(&[("job", "a"), ("env", "p")]))
        .unwrap();
    assert_eq!(got, vec![Fingerprint::from_metric(&m1)]);
}

#[test]
fn pin_evict_cycle() {
    let (tx, rx) = mpsc::sync_channel(64);
    let resident = Arc::new(AtomicUsize::new(0));

    let mut chunk = Chunk::new(Encoding::DoubleDelta);
    for s in [pair(100, 1.0), pair(200, 2.0)] {
        let mut out = chunk.add(s).unwrap();
        chunk = out.pop().unwrap();
    }
    let desc = ChunkDesc::new(chunk, Arc::clone(&resident));
    desc.maybe_populate_last_time().unwrap();

    // Release the creation reference, pin for a read, release again. The
    // requests queue up and are applied in order once the arbiter starts.
    desc.unpin(&tx);
    desc.pin(&tx);
    assert!(!desc.is_evicted());
    desc.unpin(&tx);

    let arbiter = EvictionArbiter::spawn(
        rx,
        Arc::clone(&resident),
        0,
        0,
        Duration::from_millis(10),
        noop_event_listener(),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !desc.is_evicted() {
        assert!(Instant::now() < deadline, "arbiter never evicted the chunk");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(desc.maybe_evict(), "maybe_evict is trivially true once evicted");
    assert!(desc.is_evicted());
    assert_eq!(resident.load(Ordering::Relaxed), 0);

    drop(tx);
    arbiter.join().unwrap();
}

#[test]
fn distinct_metrics_have_distinct_series() {
    let storage = MemorySeriesStorage::new(StorageConfig::default()).unwrap();
    let m1 = labels(&[("job", "a")]);
    let m2 = labels(&[("job", "b")]);
    append(&storage, &m1, 100, 1.0);
    append(&storage, &m2, 100, 2.0);
    let fp1 = Fingerprint::from_metric(&m1);
    let fp2 = Fingerprint::from_metric(&m2);
    assert_eq!(storage.clone_samples(fp1).unwrap().unwrap(), vec![pair(100, 1.0)]);
    assert_eq!(storage.clone_samples(fp2).unwrap().unwrap(), vec![pair(100, 2.0)]);
}

#[test]
fn configured_default_encoding_is_used() {
    for encoding in [Encoding::Delta, Encoding::DoubleDelta, Encoding::Varbit] {
        let storage = MemorySeriesStorage::new(StorageConfig {
            default_encoding: encoding,
            ..StorageConfig::default()
        })
        .unwrap();
        let metric = labels(&[("job", "enc")]);
        let fp = Fingerprint::from_metric(&metric);
        for i in 0..100i64 {
            append(&storage, &metric, i * 15_000, (i % 3) as f64);
        }
        let all = storage.clone_samples(fp).unwrap().unwrap();
        assert_eq!(all.len(), 100);
        assert_eq!(all[7], pair(7 * 15_000, 1.0));
    }
}
