//! Per-series sample stream: an ordered list of chunk descriptors plus the
//! open head chunk, with append and range-read entry points.

use crate::chunk::{range_values, Chunk, ChunkDesc, Encoding, EvictRequest};
use crate::error::StorageError;
use crate::types::{Fingerprint, Interval, Metric, SamplePair, Timestamp, EARLIEST};
use std::sync::atomic::AtomicUsize;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, RwLock};

struct SeriesInner {
    /// Chunk descriptors ordered by first time. The last one is the open
    /// head chunk.
    chunk_descs: Vec<Arc<ChunkDesc>>,
    /// Timestamp of the most recently appended sample, EARLIEST before the
    /// first append.
    last_sample_time: Timestamp,
}

/// One series: its metric and the ordered chunked sample stream. The
/// series lock protects descriptor membership and head mutation; reads
/// copy their results under the lock, so observers never see a torn write.
pub(crate) struct MemorySeries {
    fingerprint: Fingerprint,
    metric: Metric,
    inner: RwLock<SeriesInner>,
}

impl MemorySeries {
    pub(crate) fn new(fingerprint: Fingerprint, metric: Metric) -> MemorySeries {
        MemorySeries {
            fingerprint,
            metric,
            inner: RwLock::new(SeriesInner {
                chunk_descs: Vec::new(),
                last_sample_time: EARLIEST,
            }),
        }
    }

    pub(crate) fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Appends one sample. Samples at the series' last timestamp are
    /// deduplicated as no-ops; earlier timestamps are rejected. On chunk
    /// overflow the outgoing head's last time is populated and the
    /// returned overflow chunks become new descriptors.
    pub(crate) fn append(
        &self,
        s: SamplePair,
        encoding: Encoding,
        resident: &Arc<AtomicUsize>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write()?;
        if !inner.chunk_descs.is_empty() {
            if s.timestamp == inner.last_sample_time {
                return Ok(());
            }
            if s.timestamp < inner.last_sample_time {
                return Err(StorageError::OutOfOrderSample {
                    fingerprint: self.fingerprint,
                    timestamp: s.timestamp,
                    last_timestamp: inner.last_sample_time,
                });
            }
        }
        if inner.chunk_descs.is_empty() {
            let chunks = Chunk::new(encoding)
                .add(s)
                .map_err(|e| e.with_fingerprint(self.fingerprint))?;
            let count = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                let desc = ChunkDesc::new(chunk, Arc::clone(resident));
                if i + 1 < count {
                    desc.maybe_populate_last_time()
                        .map_err(|e| e.with_fingerprint(self.fingerprint))?;
                }
                inner.chunk_descs.push(desc);
            }
        } else {
            let head = Arc::clone(inner.chunk_descs.last().expect("non-empty descriptor list"));
            let overflow = head
                .add(s)
                .map_err(|e| e.with_fingerprint(self.fingerprint))?;
            if !overflow.is_empty() {
                head.maybe_populate_last_time()
                    .map_err(|e| e.with_fingerprint(self.fingerprint))?;
                let count = overflow.len();
                for (i, chunk) in overflow.into_iter().enumerate() {
                    let desc = ChunkDesc::new(chunk, Arc::clone(resident));
                    if i + 1 < count {
                        desc.maybe_populate_last_time()
                            .map_err(|e| e.with_fingerprint(self.fingerprint))?;
                    }
                    inner.chunk_descs.push(desc);
                }
            }
        }
        inner.last_sample_time = s.timestamp;
        Ok(())
    }

    /// Pins the descriptor, runs `f` against its resident chunk, unpins.
    /// Returns Ok(None) if the descriptor is evicted.
    fn with_pinned<R>(
        &self,
        desc: &Arc<ChunkDesc>,
        evict_requests: &SyncSender<EvictRequest>,
        f: impl FnOnce(&Chunk) -> Result<R, StorageError>,
    ) -> Result<Option<R>, StorageError> {
        desc.pin(evict_requests);
        let out = desc.with_chunk(f);
        desc.unpin(evict_requests);
        match out {
            None => Ok(None),
            Some(result) => result
                .map(Some)
                .map_err(|e| e.with_fingerprint(self.fingerprint)),
        }
    }

    /// Point query: the samples around time `t`.
    ///
    /// Returns the empty list for an empty series, the single boundary
    /// sample if `t` lies before the first or after the last sample, the
    /// exact sample if one matches `t`, and otherwise the two samples
    /// straddling `t` in timestamp order.
    pub(crate) fn get_value_at_time(
        &self,
        t: Timestamp,
        evict_requests: &SyncSender<EvictRequest>,
    ) -> Result<Vec<SamplePair>, StorageError> {
        let inner = self.inner.read()?;
        let descs = &inner.chunk_descs;
        if descs.is_empty() {
            return Ok(Vec::new());
        }
        let idx = descs.partition_point(|d| d.first_time() <= t);

        // Newest sample at or before t, walking left past evicted chunks.
        let mut before = None;
        for desc in descs[..idx].iter().rev() {
            let found = self.with_pinned(desc, evict_requests, |chunk| {
                let mut it = chunk.new_iterator();
                if it.find_at_or_before(t) {
                    Ok(Some(it.value()))
                } else {
                    match it.err() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    }
                }
            })?;
            if let Some(Some(v)) = found {
                before = Some(v);
                break;
            }
        }

        // Oldest sample at or after t, walking right. The candidate chunk
        // may hold both neighbours, so the walk starts there.
        let mut after = None;
        for desc in descs[idx.saturating_sub(1)..].iter() {
            let found = self.with_pinned(desc, evict_requests, |chunk| {
                let mut it = chunk.new_iterator();
                if it.find_at_or_after(t) {
                    Ok(Some(it.value()))
                } else {
                    match it.err() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    }
                }
            })?;
            if let Some(Some(v)) = found {
                after = Some(v);
                break;
            }
        }

        Ok(match (before, after) {
            (Some(b), Some(a)) if b.timestamp == a.timestamp => vec![b],
            (Some(b), Some(a)) => vec![b, a],
            (Some(b), None) => vec![b],
            (None, Some(a)) => vec![a],
            (None, None) => Vec::new(),
        })
    }

    /// Boundary query: the first and last sample within the interval, at
    /// most two pairs.
    pub(crate) fn get_boundary_values(
        &self,
        interval: Interval,
        evict_requests: &SyncSender<EvictRequest>,
    ) -> Result<Vec<SamplePair>, StorageError> {
        if interval.oldest_inclusive > interval.newest_inclusive {
            return Ok(Vec::new());
        }
        let inner = self.inner.read()?;
        let descs = &inner.chunk_descs;

        let mut first = None;
        for desc in descs.iter() {
            if desc.first_time() > interval.newest_inclusive {
                break;
            }
            let found = self.with_pinned(desc, evict_requests, |chunk| {
                let mut it = chunk.new_iterator();
                if it.find_at_or_after(interval.oldest_inclusive) {
                    Ok(Some(it.value()))
                } else {
                    match it.err() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    }
                }
            })?;
            if let Some(Some(v)) = found {
                if v.timestamp <= interval.newest_inclusive {
                    first = Some(v);
                }
                break;
            }
        }
        if first.is_none() {
            return Ok(Vec::new());
        }

        let mut last = None;
        for desc in descs.iter().rev() {
            if desc.first_time() > interval.newest_inclusive {
                continue;
            }
            let found = self.with_pinned(desc, evict_requests, |chunk| {
                let mut it = chunk.new_iterator();
                if it.find_at_or_before(interval.newest_inclusive) {
                    Ok(Some(it.value()))
                } else {
                    match it.err() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    }
                }
            })?;
            if let Some(Some(v)) = found {
                if v.timestamp >= interval.oldest_inclusive {
                    last = Some(v);
                }
                break;
            }
        }

        Ok(match (first, last) {
            (Some(f), Some(l)) if f.timestamp == l.timestamp => vec![f],
            (Some(f), Some(l)) => vec![f, l],
            (Some(f), None) => vec![f],
            (None, _) => Vec::new(),
        })
    }

    /// Range query: a fresh copy of every sample within the interval.
    pub(crate) fn get_range_values(
        &self,
        interval: Interval,
        evict_requests: &SyncSender<EvictRequest>,
    ) -> Result<Vec<SamplePair>, StorageError> {
        if interval.oldest_inclusive > interval.newest_inclusive {
            return Ok(Vec::new());
        }
        let inner = self.inner.read()?;
        let mut result = Vec::new();
        for desc in inner.chunk_descs.iter() {
            if desc.first_time() > interval.newest_inclusive {
                break;
            }
            let chunk_samples = self.with_pinned(desc, evict_requests, |chunk| {
                let mut it = chunk.new_iterator();
                range_values(&mut it, interval)
            })?;
            if let Some(samples) = chunk_samples {
                result.extend(samples);
            }
        }
        Ok(result)
    }

    /// Snapshot copy of the entire sample sequence.
    pub(crate) fn clone_samples(
        &self,
        evict_requests: &SyncSender<EvictRequest>,
    ) -> Result<Vec<SamplePair>, StorageError> {
        let inner = self.inner.read()?;
        let mut result = Vec::new();
        for desc in inner.chunk_descs.iter() {
            let chunk_samples = self.with_pinned(desc, evict_requests, |chunk| {
                let mut it = chunk.new_iterator();
                let mut samples = Vec::with_capacity(chunk.len());
                while it.scan() {
                    samples.push(it.value());
                }
                match it.err() {
                    Some(e) => Err(e),
                    None => Ok(samples),
                }
            })?;
            if let Some(samples) = chunk_samples {
                result.extend(samples);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, SyncSender};

    fn series() -> (MemorySeries, SyncSender<EvictRequest>, Arc<AtomicUsize>) {
        let metric: Metric = [("job".to_string(), "a".to_string())].into_iter().collect();
        let fp = Fingerprint::from_metric(&metric);
        let (tx, rx) = mpsc::sync_channel(1024);
        // Queries pin already-pinned descriptors, so nothing ever reaches
        // the channel; keep the receiver alive anyway.
        std::mem::forget(rx);
        (MemorySeries::new(fp, metric), tx, Arc::new(AtomicUsize::new(0)))
    }

    fn pair(timestamp: Timestamp, value: f64) -> SamplePair {
        SamplePair { timestamp, value }
    }

    fn append_all(s: &MemorySeries, resident: &Arc<AtomicUsize>, samples: &[SamplePair]) {
        for &sample in samples {
            s.append(sample, Encoding::DoubleDelta, resident).unwrap();
        }
    }

    #[test]
    fn point_query_cases() {
        let (series, tx, resident) = series();
        assert!(series.get_value_at_time(100, &tx).unwrap().is_empty());

        append_all(&series, &resident, &[pair(100, 1.0), pair(200, 2.0), pair(300, 3.0)]);

        assert_eq!(series.get_value_at_time(200, &tx).unwrap(), vec![pair(200, 2.0)]);
        assert_eq!(
            series.get_value_at_time(150, &tx).unwrap(),
            vec![pair(100, 1.0), pair(200, 2.0)]
        );
        assert_eq!(series.get_value_at_time(50, &tx).unwrap(), vec![pair(100, 1.0)]);
        assert_eq!(series.get_value_at_time(400, &tx).unwrap(), vec![pair(300, 3.0)]);
    }

    #[test]
    fn point_query_single_sample() {
        let (series, tx, resident) = series();
        append_all(&series, &resident, &[pair(100, 1.0)]);
        for t in [50, 100, 150] {
            assert_eq!(series.get_value_at_time(t, &tx).unwrap(), vec![pair(100, 1.0)]);
        }
    }

    #[test]
    fn boundary_and_range_queries() {
        let (series, tx, resident) = series();
        append_all(&series, &resident, &[pair(100, 1.0), pair(200, 2.0), pair(300, 3.0)]);

        assert_eq!(
            series.get_range_values(Interval::new(150, 250), &tx).unwrap(),
            vec![pair(200, 2.0)]
        );
        assert_eq!(
            series.get_boundary_values(Interval::new(150, 250), &tx).unwrap(),
            vec![pair(200, 2.0)]
        );
        assert_eq!(
            series.get_range_values(Interval::new(100, 300), &tx).unwrap(),
            vec![pair(100, 1.0), pair(200, 2.0), pair(300, 3.0)]
        );
        assert_eq!(
            series.get_boundary_values(Interval::new(100, 300), &tx).unwrap(),
            vec![pair(100, 1.0), pair(300, 3.0)]
        );
        assert!(series
            .get_range_values(Interval::new(301, 400), &tx)
            .unwrap()
            .is_empty());
        assert!(series
            .get_boundary_values(Interval::new(301, 400), &tx)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn duplicate_timestamps_are_noops() {
        let (series, tx, resident) = series();
        append_all(&series, &resident, &[pair(100, 1.0)]);
        series.append(pair(100, 9.0), Encoding::DoubleDelta, &resident).unwrap();
        assert_eq!(series.clone_samples(&tx).unwrap(), vec![pair(100, 1.0)]);
    }

    #[test]
    fn out_of_order_appends_are_rejected() {
        let (series, _tx, resident) = series();
        append_all(&series, &resident, &[pair(100, 1.0)]);
        let err = series
            .append(pair(50, 2.0), Encoding::DoubleDelta, &resident)
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrderSample { .. }));
    }

    #[test]
    fn append_spans_multiple_chunks() {
        let (series, tx, resident) = series();
        let samples: Vec<SamplePair> = (0..100_000i64)
            .map(|i| pair(i * 250, (i % 17) as f64 * 0.5))
            .collect();
        append_all(&series, &resident, &samples);

        let descs: Vec<Arc<ChunkDesc>> = series.inner.read().unwrap().chunk_descs.clone();
        assert!(descs.len() > 1);
        for pair in descs.windows(2) {
            assert!(pair[0].first_time() < pair[1].first_time());
            assert!(pair[0].last_time().unwrap() < pair[1].first_time());
        }
        assert_eq!(series.clone_samples(&tx).unwrap(), samples);

        // Cross-chunk straddle: query between the last sample of one chunk
        // and the first of the next.
        let boundary = descs[1].first_time();
        let got = series.get_value_at_time(boundary - 1, &tx).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].timestamp < boundary - 1 && got[1].timestamp == boundary);
    }
}
