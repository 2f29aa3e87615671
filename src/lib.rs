#![doc = r#"
emberdb: In-Memory Time-Series Storage Core in Rust

This crate provides the in-memory storage core of a metrics database. It
ingests labeled numeric samples, groups them into per-series streams backed
by fixed-size compressed chunks, and answers point and range queries
against those chunks. It supports:
- Three chunk encodings (Delta, DoubleDelta, Varbit) with bit-exact decode
- Reference-counted chunk descriptors with pin/unpin lifecycle
- LRU chunk eviction driven by a background arbiter under memory pressure
- A triple series index (fingerprint, label pair, label name) with
  set-intersection label matching
- Thread-safe appends and snapshot-isolated reads

Durability, crash recovery, and the query evaluator live in outer layers;
collaborators such as the watermark cache are consumed through traits.
"#]

// Declare modules
pub mod chunk;
pub mod encoding;
pub mod error;
pub mod eviction;
mod series;
pub mod storage;
pub mod telemetry;
pub mod types;

/// Main entry point: the in-memory series storage.
pub use crate::storage::MemorySeriesStorage;
/// Configuration options for the storage.
pub use crate::storage::StorageConfig;
/// Watermark cache collaborator interface.
pub use crate::storage::{noop_watermark_cache, NoopWatermarkCache, WatermarkCache, Watermarks};
/// Error type for storage operations.
pub use crate::error::StorageError;
/// Chunk encoding selector.
pub use crate::chunk::Encoding;
/// Chunk, chunk iterator, and descriptor surface.
pub use crate::chunk::{range_values, Chunk, ChunkDesc, ChunkIterator, EvictRequest, CHUNK_LEN};
/// Structured event hook for observability.
pub use crate::telemetry::{noop_event_listener, StorageEvent, StorageEventListener};
/// Model types.
pub use crate::types::{
    Fingerprint, Interval, LabelName, LabelSet, LabelValue, Metric, Sample, SamplePair, Timestamp,
    EARLIEST, LATEST, ZERO_SAMPLE_PAIR,
};
