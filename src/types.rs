use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Sentinel timestamp earlier than any valid sample. Used for unset
/// last-times on open chunks and for the zero sample pair.
pub const EARLIEST: Timestamp = i64::MIN;

/// Sentinel timestamp later than any valid sample.
pub const LATEST: Timestamp = i64::MAX;

/// Label name type (non-empty UTF-8).
pub type LabelName = String;

/// Label value type. An empty value is equivalent to the label being absent.
pub type LabelValue = String;

/// An ordered mapping from label names to label values. The ordering makes
/// fingerprinting deterministic.
pub type LabelSet = BTreeMap<LabelName, LabelValue>;

/// A metric is identified by its label set.
pub type Metric = LabelSet;

/// A single timestamp/value pair within a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePair {
    pub timestamp: Timestamp,
    pub value: f64,
}

/// The pair returned by iterators before any successful positioning call.
pub const ZERO_SAMPLE_PAIR: SamplePair = SamplePair {
    timestamp: EARLIEST,
    value: 0.0,
};

/// A sample as handed to the storage by the ingestion layer: a metric plus
/// one timestamp/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric: Metric,
    pub timestamp: Timestamp,
    pub value: f64,
}

/// An inclusive time interval for boundary and range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub oldest_inclusive: Timestamp,
    pub newest_inclusive: Timestamp,
}

impl Interval {
    pub fn new(oldest_inclusive: Timestamp, newest_inclusive: Timestamp) -> Self {
        Interval {
            oldest_inclusive,
            newest_inclusive,
        }
    }
}

/// The 64-bit identity of a metric. Derived deterministically from the
/// label set; the storage treats it as the canonical series identity and
/// never re-hashes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Computes the fingerprint of a metric: FNV-1a over the ordered
    /// `(name, value)` pairs with NUL separators. Labels with empty values
    /// are skipped, so a metric carrying an empty-valued label fingerprints
    /// identically to one without that label.
    pub fn from_metric(metric: &Metric) -> Fingerprint {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        let mut step = |bytes: &[u8]| {
            for &b in bytes {
                hash ^= u64::from(b);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
            // NUL separator between fields.
            hash = hash.wrapping_mul(FNV_PRIME);
        };
        for (name, value) in metric {
            if value.is_empty() {
                continue;
            }
            step(name.as_bytes());
            step(value.as_bytes());
        }
        Fingerprint(hash)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Returns a copy of the metric with empty-valued labels removed. This is
/// the canonical form kept per series and registered in the label indexes.
pub(crate) fn without_empty_labels(metric: &Metric) -> Metric {
    metric
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
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

    #[test]
    fn fingerprint_is_deterministic() {
        let m = labels(&[("job", "api"), ("instance", "a")]);
        assert_eq!(Fingerprint::from_metric(&m), Fingerprint::from_metric(&m));
    }

    #[test]
    fn fingerprint_distinguishes_metrics() {
        let a = labels(&[("job", "api")]);
        let b = labels(&[("job", "web")]);
        let c = labels(&[("jo", "bapi")]);
        assert_ne!(Fingerprint::from_metric(&a), Fingerprint::from_metric(&b));
        assert_ne!(Fingerprint::from_metric(&a), Fingerprint::from_metric(&c));
    }

    #[test]
    fn empty_label_values_are_equivalent_to_absent() {
        let with_empty = labels(&[("job", "api"), ("env", "")]);
        let without = labels(&[("job", "api")]);
        assert_eq!(
            Fingerprint::from_metric(&with_empty),
            Fingerprint::from_metric(&without)
        );
        assert_eq!(without_empty_labels(&with_empty), without);
    }
}
