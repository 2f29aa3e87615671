use crate::types::Fingerprint;
use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly is not acceptable for
/// production. Callers can provide an implementation that forwards these
/// events to `tracing`, `log`, metrics, or custom sinks.
pub trait StorageEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: StorageEvent);
}

/// Structured events emitted by the storage core.
#[derive(Debug, Clone)]
pub enum StorageEvent {
    EvictionArbiterStarted,
    EvictionArbiterStopping,

    /// A new series was created on first append.
    SeriesCreated { fingerprint: Fingerprint },

    /// The arbiter completed a memory-pressure walk over the LRU list.
    EvictionCycle { evicted: usize, resident: usize },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl StorageEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: StorageEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn StorageEventListener> {
    Arc::new(NoopEventListener)
}
