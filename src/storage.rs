//! The in-memory series storage: fingerprint-to-series map, label
//! inverted indexes, and the public append/query surface.

use crate::chunk::{Encoding, EvictRequest};
use crate::error::StorageError;
use crate::eviction::EvictionArbiter;
use crate::series::MemorySeries;
use crate::telemetry::{noop_event_listener, StorageEvent, StorageEventListener};
use crate::types::{
    without_empty_labels, Fingerprint, Interval, LabelName, LabelSet, LabelValue, Metric, Sample,
    SamplePair, Timestamp,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Per-series high-timestamp watermarks, as reported to the watermark
/// cache collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: Timestamp,
}

/// External collaborator tracking per-series high timestamps. Updates are
/// fire-and-forget; the storage never reads the cache's state.
pub trait WatermarkCache: std::fmt::Debug + Send + Sync + 'static {
    fn set(&self, fingerprint: Fingerprint, watermarks: Watermarks);
}

#[derive(Debug)]
pub struct NoopWatermarkCache;

impl WatermarkCache for NoopWatermarkCache {
    #[inline]
    fn set(&self, _fingerprint: Fingerprint, _watermarks: Watermarks) {}
}

pub fn noop_watermark_cache() -> Arc<dyn WatermarkCache> {
    Arc::new(NoopWatermarkCache)
}

/// Configuration options for [`MemorySeriesStorage`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Encoding for the first chunk of each new series. Overflow chunks
    /// inherit the encoding of the chunk that overflowed.
    pub default_encoding: Encoding,
    /// Buffer size of the evict-request channel. Sized so that sending is
    /// effectively non-blocking under steady state.
    pub evict_request_capacity: usize,
    /// Resident chunk count above which the arbiter starts evicting.
    pub high_water_chunks: usize,
    /// Resident chunk count at which an eviction cycle stops.
    pub low_water_chunks: usize,
    /// How often the arbiter checks memory pressure when idle.
    pub pressure_check_interval: Duration,
    /// Watermark cache collaborator (no-op by default).
    pub watermark_cache: Arc<dyn WatermarkCache>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn StorageEventListener>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            default_encoding: Encoding::DoubleDelta,
            evict_request_capacity: 1024,
            high_water_chunks: 1 << 20,
            low_water_chunks: (1 << 20) - (1 << 17),
            pressure_check_interval: Duration::from_secs(1),
            watermark_cache: noop_watermark_cache(),
            event_listener: noop_event_listener(),
        }
    }
}

#[derive(Default)]
struct StorageInner {
    by_fingerprint: HashMap<Fingerprint, Arc<MemorySeries>>,
    by_label_pair: HashMap<(LabelName, LabelValue), HashSet<Fingerprint>>,
    by_label_name: HashMap<LabelName, HashSet<Fingerprint>>,
}

/// The in-memory time-series storage core.
///
/// Holds one stream per fingerprint plus two inverted indexes for
/// label-matching queries. A global read-write lock serializes structural
/// mutation (series creation, index insertion); per-series appends and
/// reads take only the series lock once the series is resolved.
pub struct MemorySeriesStorage {
    inner: RwLock<StorageInner>,
    // None only during drop, so the arbiter sees a disconnect and exits.
    evict_requests: Option<SyncSender<EvictRequest>>,
    arbiter: Option<JoinHandle<()>>,
    resident_chunks: Arc<AtomicUsize>,
    default_encoding: Encoding,
    watermark_cache: Arc<dyn WatermarkCache>,
    events: Arc<dyn StorageEventListener>,
}

impl MemorySeriesStorage {
    /// Creates the storage and spawns its eviction arbiter thread.
    pub fn new(config: StorageConfig) -> Result<MemorySeriesStorage, StorageError> {
        let (evict_tx, evict_rx) = mpsc::sync_channel(config.evict_request_capacity);
        let resident_chunks = Arc::new(AtomicUsize::new(0));
        let arbiter = EvictionArbiter::spawn(
            evict_rx,
            Arc::clone(&resident_chunks),
            config.high_water_chunks,
            config.low_water_chunks,
            config.pressure_check_interval,
            Arc::clone(&config.event_listener),
        )
        .map_err(|e| {
            StorageError::BackgroundTask(format!("failed to spawn eviction arbiter: {}", e))
        })?;
        Ok(MemorySeriesStorage {
            inner: RwLock::new(StorageInner::default()),
            evict_requests: Some(evict_tx),
            arbiter: Some(arbiter),
            resident_chunks,
            default_encoding: config.default_encoding,
            watermark_cache: config.watermark_cache,
            events: config.event_listener,
        })
    }

    fn evict_requests(&self) -> &SyncSender<EvictRequest> {
        self.evict_requests
            .as_ref()
            .expect("evict channel open for the storage lifetime")
    }

    /// Appends one sample, creating the series and its index entries on
    /// first sight of the metric.
    pub fn append_sample(&self, sample: &Sample) -> Result<(), StorageError> {
        let fingerprint = Fingerprint::from_metric(&sample.metric);
        let series = {
            let mut inner = self.inner.write()?;
            let series = match inner.by_fingerprint.get(&fingerprint) {
                Some(series) => Arc::clone(series),
                None => {
                    let metric = without_empty_labels(&sample.metric);
                    let series = Arc::new(MemorySeries::new(fingerprint, metric));
                    inner.by_fingerprint.insert(fingerprint, Arc::clone(&series));
                    for (name, value) in series.metric().clone() {
                        inner
                            .by_label_pair
                            .entry((name.clone(), value))
                            .or_default()
                            .insert(fingerprint);
                        inner.by_label_name.entry(name).or_default().insert(fingerprint);
                    }
                    self.events
                        .on_event(StorageEvent::SeriesCreated { fingerprint });
                    series
                }
            };
            self.watermark_cache.set(
                fingerprint,
                Watermarks {
                    high: sample.timestamp,
                },
            );
            series
        };
        series.append(
            SamplePair {
                timestamp: sample.timestamp,
                value: sample.value,
            },
            self.default_encoding,
            &self.resident_chunks,
        )
    }

    /// Appends a batch of samples, stopping at the first error.
    pub fn append_samples(&self, samples: &[Sample]) -> Result<(), StorageError> {
        for sample in samples {
            self.append_sample(sample)?;
        }
        Ok(())
    }

    /// The fingerprints whose metrics carry every `(name, value)` pair of
    /// the label set. The empty label set matches nothing. Order of the
    /// result is unspecified.
    pub fn get_fingerprints_for_label_set(
        &self,
        labels: &LabelSet,
    ) -> Result<Vec<Fingerprint>, StorageError> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read()?;
        let mut intersection: Option<HashSet<Fingerprint>> = None;
        for (name, value) in labels {
            let set = inner
                .by_label_pair
                .get(&(name.clone(), value.clone()))
                .cloned()
                .unwrap_or_default();
            intersection = Some(match intersection {
                None => set,
                Some(acc) => acc.intersection(&set).copied().collect(),
            });
        }
        Ok(intersection.unwrap_or_default().into_iter().collect())
    }

    /// The fingerprints of all series carrying the label name, in
    /// unspecified order.
    pub fn get_fingerprints_for_label_name(
        &self,
        name: &str,
    ) -> Result<Vec<Fingerprint>, StorageError> {
        let inner = self.inner.read()?;
        Ok(inner
            .by_label_name
            .get(name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    /// A defensive copy of the metric for the fingerprint, or None if
    /// unknown.
    pub fn get_metric_for_fingerprint(
        &self,
        fingerprint: Fingerprint,
    ) -> Result<Option<Metric>, StorageError> {
        let inner = self.inner.read()?;
        Ok(inner
            .by_fingerprint
            .get(&fingerprint)
            .map(|series| series.metric().clone()))
    }

    /// The distinct values observed for a label name across all series, in
    /// unspecified order.
    pub fn get_all_values_for_label(&self, name: &str) -> Result<Vec<LabelValue>, StorageError> {
        let inner = self.inner.read()?;
        let mut seen = HashSet::new();
        for series in inner.by_fingerprint.values() {
            if let Some(value) = series.metric().get(name) {
                seen.insert(value.clone());
            }
        }
        Ok(seen.into_iter().collect())
    }

    fn series(&self, fingerprint: Fingerprint) -> Result<Option<Arc<MemorySeries>>, StorageError> {
        let inner = self.inner.read()?;
        Ok(inner.by_fingerprint.get(&fingerprint).cloned())
    }

    /// A snapshot copy of the series' full sample sequence, or None if the
    /// fingerprint is unknown.
    pub fn clone_samples(
        &self,
        fingerprint: Fingerprint,
    ) -> Result<Option<Vec<SamplePair>>, StorageError> {
        match self.series(fingerprint)? {
            None => Ok(None),
            Some(series) => series.clone_samples(self.evict_requests()).map(Some),
        }
    }

    /// Point query; see the series-level semantics. Unknown fingerprints
    /// yield an empty result, not an error.
    pub fn get_value_at_time(
        &self,
        fingerprint: Fingerprint,
        t: Timestamp,
    ) -> Result<Vec<SamplePair>, StorageError> {
        match self.series(fingerprint)? {
            None => Ok(Vec::new()),
            Some(series) => series.get_value_at_time(t, self.evict_requests()),
        }
    }

    /// At most the first and last sample within the interval.
    pub fn get_boundary_values(
        &self,
        fingerprint: Fingerprint,
        interval: Interval,
    ) -> Result<Vec<SamplePair>, StorageError> {
        match self.series(fingerprint)? {
            None => Ok(Vec::new()),
            Some(series) => series.get_boundary_values(interval, self.evict_requests()),
        }
    }

    /// Every sample within the interval, in order.
    pub fn get_range_values(
        &self,
        fingerprint: Fingerprint,
        interval: Interval,
    ) -> Result<Vec<SamplePair>, StorageError> {
        match self.series(fingerprint)? {
            None => Ok(Vec::new()),
            Some(series) => series.get_range_values(interval, self.evict_requests()),
        }
    }

    /// Current number of chunks resident in memory.
    pub fn resident_chunks(&self) -> usize {
        self.resident_chunks.load(Ordering::Relaxed)
    }

    /// Terminal operation: drops all series and index entries. Samples
    /// already copied out by in-flight queries remain valid.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write()?;
        inner.by_fingerprint.clear();
        inner.by_label_pair.clear();
        inner.by_label_name.clear();
        Ok(())
    }
}

impl Drop for MemorySeriesStorage {
    fn drop(&mut self) {
        // Disconnect the channel so the arbiter exits, then join it.
        self.evict_requests = None;
        if let Some(handle) = self.arbiter.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample(metric: LabelSet, timestamp: Timestamp, value: f64) -> Sample {
        Sample {
            metric,
            timestamp,
            value,
        }
    }

    fn storage() -> MemorySeriesStorage {
        MemorySeriesStorage::new(StorageConfig::default()).unwrap()
    }

    #[test]
    fn append_updates_all_three_indexes() {
        let storage = storage();
        let metric = labels(&[("job", "api"), ("env", "prod")]);
        let fp = Fingerprint::from_metric(&metric);
        storage.append_sample(&sample(metric.clone(), 100, 1.0)).unwrap();

        assert_eq!(storage.get_metric_for_fingerprint(fp).unwrap(), Some(metric.clone()));
        for (name, value) in &metric {
            let pair_query = labels(&[(name.as_str(), value.as_str())]);
            assert!(storage
                .get_fingerprints_for_label_set(&pair_query)
                .unwrap()
                .contains(&fp));
            assert!(storage
                .get_fingerprints_for_label_name(name)
                .unwrap()
                .contains(&fp));
        }
    }

    #[test]
    fn label_set_intersection() {
        let storage = storage();
        let m1 = labels(&[("job", "a"), ("env", "p")]);
        let m2 = labels(&[("job", "a"), ("env", "q")]);
        let m3 = labels(&[("job", "b"), ("env", "p")]);
        storage.append_sample(&sample(m1.clone(), 1, 1.0)).unwrap();
        storage.append_sample(&sample(m2, 1, 1.0)).unwrap();
        storage.append_sample(&sample(m3, 1, 1.0)).unwrap();

        let got = storage
            .get_fingerprints_for_label_set(&labels(&[("job", "a"), ("env", "p")]))
            .unwrap();
        assert_eq!(got, vec![Fingerprint::from_metric(&m1)]);

        let job_a = storage
            .get_fingerprints_for_label_set(&labels(&[("job", "a")]))
            .unwrap();
        assert_eq!(job_a.len(), 2);

        assert!(storage
            .get_fingerprints_for_label_set(&labels(&[("job", "zzz")]))
            .unwrap()
            .is_empty());
        assert!(storage
            .get_fingerprints_for_label_set(&LabelSet::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn all_values_for_label() {
        let storage = storage();
        storage
            .append_sample(&sample(labels(&[("job", "a")]), 1, 1.0))
            .unwrap();
        storage
            .append_sample(&sample(labels(&[("job", "b"), ("env", "p")]), 1, 1.0))
            .unwrap();
        storage
            .append_sample(&sample(labels(&[("job", "b")]), 1, 1.0))
            .unwrap();
        let mut values = storage.get_all_values_for_label("job").unwrap();
        values.sort();
        assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
        assert!(storage.get_all_values_for_label("nope").unwrap().is_empty());
    }

    #[test]
    fn unknown_fingerprints_are_not_errors() {
        let storage = storage();
        let fp = Fingerprint(12345);
        assert_eq!(storage.get_metric_for_fingerprint(fp).unwrap(), None);
        assert_eq!(storage.clone_samples(fp).unwrap(), None);
        assert!(storage.get_value_at_time(fp, 0).unwrap().is_empty());
        assert!(storage
            .get_range_values(fp, Interval::new(0, 100))
            .unwrap()
            .is_empty());
        assert!(storage
            .get_boundary_values(fp, Interval::new(0, 100))
            .unwrap()
            .is_empty());
        assert!(storage.get_fingerprints_for_label_name("x").unwrap().is_empty());
    }

    #[test]
    fn empty_label_values_do_not_index() {
        let storage = storage();
        let metric = labels(&[("job", "a"), ("env", "")]);
        storage.append_sample(&sample(metric.clone(), 1, 1.0)).unwrap();
        let fp = Fingerprint::from_metric(&metric);
        assert_eq!(
            storage.get_metric_for_fingerprint(fp).unwrap(),
            Some(labels(&[("job", "a")]))
        );
        assert!(storage.get_fingerprints_for_label_name("env").unwrap().is_empty());
    }

    #[test]
    fn watermark_cache_sees_high_timestamps() {
        #[derive(Debug, Default)]
        struct RecordingCache(std::sync::Mutex<HashMap<Fingerprint, Timestamp>>);
        impl WatermarkCache for RecordingCache {
            fn set(&self, fingerprint: Fingerprint, watermarks: Watermarks) {
                self.0
                    .lock()
                    .unwrap()
                    .insert(fingerprint, watermarks.high);
            }
        }

        let cache = Arc::new(RecordingCache::default());
        let storage = MemorySeriesStorage::new(StorageConfig {
            watermark_cache: cache.clone(),
            ..StorageConfig::default()
        })
        .unwrap();
        let metric = labels(&[("job", "a")]);
        let fp = Fingerprint::from_metric(&metric);
        storage.append_sample(&sample(metric.clone(), 100, 1.0)).unwrap();
        storage.append_sample(&sample(metric, 200, 2.0)).unwrap();
        assert_eq!(cache.0.lock().unwrap().get(&fp), Some(&200));
    }

    #[test]
    fn close_drops_everything() {
        let storage = storage();
        let metric = labels(&[("job", "a")]);
        let fp = Fingerprint::from_metric(&metric);
        storage.append_sample(&sample(metric, 100, 1.0)).unwrap();
        storage.close().unwrap();
        assert_eq!(storage.get_metric_for_fingerprint(fp).unwrap(), None);
        assert!(storage.get_fingerprints_for_label_name("job").unwrap().is_empty());
        assert_eq!(storage.clone_samples(fp).unwrap(), None);
    }

    #[test]
    fn resident_chunk_gauge_tracks_series() {
        let storage = storage();
        assert_eq!(storage.resident_chunks(), 0);
        storage
            .append_sample(&sample(labels(&[("job", "a")]), 1, 1.0))
            .unwrap();
        storage
            .append_sample(&sample(labels(&[("job", "b")]), 1, 1.0))
            .unwrap();
        assert_eq!(storage.resident_chunks(), 2);
    }
}
