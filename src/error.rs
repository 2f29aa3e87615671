use crate::types::{Fingerprint, Timestamp};
use thiserror::Error;

/// Error type for storage operations.
///
/// Only data errors are represented here; invariant violations (unpin
/// underflow, evicting an open chunk, double chunk installation) are
/// programming errors and panic instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("invalid chunk encoding: {0}")]
    InvalidEncoding(u8),

    #[error("attempted access outside of chunk boundaries")]
    ChunkBoundsExceeded,

    #[error("corruption detected: {details}")]
    Corruption {
        details: String,
        fingerprint: Option<Fingerprint>,
        timestamp: Option<Timestamp>,
    },

    #[error("sample at {timestamp} predates last sample at {last_timestamp} of series {fingerprint}")]
    OutOfOrderSample {
        fingerprint: Fingerprint,
        timestamp: Timestamp,
        last_timestamp: Timestamp,
    },

    #[error("lock acquisition failed: {0}")]
    Lock(String),

    #[error("background task error: {0}")]
    BackgroundTask(String),
}

impl StorageError {
    pub(crate) fn corruption(details: impl Into<String>) -> Self {
        StorageError::Corruption {
            details: details.into(),
            fingerprint: None,
            timestamp: None,
        }
    }

    /// Attaches the owning series' fingerprint to a corruption error so it
    /// never leaves the storage without identifying the series.
    pub(crate) fn with_fingerprint(self, fp: Fingerprint) -> Self {
        match self {
            StorageError::Corruption {
                details, timestamp, ..
            } => StorageError::Corruption {
                details,
                fingerprint: Some(fp),
                timestamp,
            },
            other => other,
        }
    }
}

// Convert lock poison errors so fallible paths can use `?` directly.
impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StorageError::Lock(format!("lock poisoned: {}", err))
    }
}
