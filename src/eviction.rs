//! Eviction arbiter: a dedicated thread that owns the LRU list of
//! unpinned chunk descriptors and evicts chunk payloads under memory
//! pressure.

use crate::chunk::{ChunkDesc, EvictRequest};
use crate::telemetry::{StorageEvent, StorageEventListener};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// LRU list of unpinned descriptors. The front is the least recently
/// unpinned. Membership is keyed by descriptor identity (the `Arc`
/// pointer); the descriptor itself holds no link into the list, so
/// ownership stays entirely with the arbiter.
#[derive(Debug, Default)]
struct EvictList {
    next_seq: u64,
    by_seq: BTreeMap<u64, Arc<ChunkDesc>>,
    seq_of: HashMap<usize, u64>,
}

impl EvictList {
    fn key(desc: &Arc<ChunkDesc>) -> usize {
        Arc::as_ptr(desc) as usize
    }

    /// Appends at the back, moving the descriptor there if already listed.
    fn push_back(&mut self, desc: Arc<ChunkDesc>) {
        self.remove(&desc);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_of.insert(Self::key(&desc), seq);
        self.by_seq.insert(seq, desc);
    }

    /// Removes the descriptor if present; a no-op otherwise.
    fn remove(&mut self, desc: &Arc<ChunkDesc>) {
        if let Some(seq) = self.seq_of.remove(&Self::key(desc)) {
            self.by_seq.remove(&seq);
        }
    }

    fn pop_front(&mut self) -> Option<Arc<ChunkDesc>> {
        let (&seq, _) = self.by_seq.iter().next()?;
        let desc = self.by_seq.remove(&seq)?;
        self.seq_of.remove(&Self::key(&desc));
        Some(desc)
    }

    fn len(&self) -> usize {
        self.by_seq.len()
    }
}

/// The single consumer of the evict-request channel. It alone mutates the
/// LRU list; it never takes the storage or series locks, only descriptor
/// mutexes.
pub struct EvictionArbiter {
    requests: Receiver<EvictRequest>,
    list: EvictList,
    resident: Arc<AtomicUsize>,
    high_water: usize,
    low_water: usize,
    check_interval: Duration,
    events: Arc<dyn StorageEventListener>,
}

impl EvictionArbiter {
    /// Spawns the arbiter thread. It exits when every request sender is
    /// dropped.
    pub fn spawn(
        requests: Receiver<EvictRequest>,
        resident: Arc<AtomicUsize>,
        high_water: usize,
        low_water: usize,
        check_interval: Duration,
        events: Arc<dyn StorageEventListener>,
    ) -> std::io::Result<JoinHandle<()>> {
        let arbiter = EvictionArbiter {
            requests,
            list: EvictList::default(),
            resident,
            high_water,
            low_water: low_water.min(high_water),
            check_interval,
            events,
        };
        thread::Builder::new()
            .name("evict-arbiter".to_string())
            .spawn(move || arbiter.run())
    }

    fn run(mut self) {
        self.events.on_event(StorageEvent::EvictionArbiterStarted);
        loop {
            match self.requests.recv_timeout(self.check_interval) {
                Ok(request) => {
                    self.handle(request);
                    // Drain whatever else is queued before checking
                    // pressure, keeping the per-descriptor request order.
                    while let Ok(request) = self.requests.try_recv() {
                        self.handle(request);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.maybe_relieve_pressure();
        }
        self.events.on_event(StorageEvent::EvictionArbiterStopping);
    }

    fn handle(&mut self, request: EvictRequest) {
        if request.evict {
            self.list.push_back(request.desc);
        } else {
            self.list.remove(&request.desc);
        }
    }

    /// Walks the list from the least recently unpinned end, evicting until
    /// the resident chunk count drops to the low-water mark or the list is
    /// exhausted.
    fn maybe_relieve_pressure(&mut self) {
        if self.resident.load(Ordering::Relaxed) <= self.high_water {
            return;
        }
        let mut evicted = 0usize;
        while self.resident.load(Ordering::Relaxed) > self.low_water {
            let Some(desc) = self.list.pop_front() else {
                break;
            };
            // A pinned descriptor here lost a race against its own pin
            // request; dropping its link is benign, the next unpin
            // re-enqueues it.
            if desc.maybe_evict() {
                evicted += 1;
            }
        }
        self.events.on_event(StorageEvent::EvictionCycle {
            evicted,
            resident: self.resident.load(Ordering::Relaxed),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, Encoding};
    use crate::telemetry::noop_event_listener;
    use crate::types::SamplePair;
    use std::sync::mpsc;
    use std::time::Instant;

    fn closed_desc(resident: &Arc<AtomicUsize>) -> Arc<ChunkDesc> {
        let mut chunk = Chunk::new(Encoding::DoubleDelta);
        for s in [
            SamplePair { timestamp: 100, value: 1.0 },
            SamplePair { timestamp: 200, value: 2.0 },
        ] {
            let mut out = chunk.add(s).unwrap();
            chunk = out.pop().unwrap();
        }
        let desc = ChunkDesc::new(chunk, Arc::clone(resident));
        desc.maybe_populate_last_time().unwrap();
        desc
    }

    #[test]
    fn evict_list_is_fifo_and_idempotent() {
        let resident = Arc::new(AtomicUsize::new(0));
        let a = closed_desc(&resident);
        let b = closed_desc(&resident);
        let mut list = EvictList::default();

        // Removing an unlisted descriptor is a no-op.
        list.remove(&a);
        assert_eq!(list.len(), 0);

        list.push_back(Arc::clone(&a));
        list.push_back(Arc::clone(&b));
        assert_eq!(list.len(), 2);

        // Re-adding moves to the back.
        list.push_back(Arc::clone(&a));
        assert_eq!(list.len(), 2);
        let front = list.pop_front().unwrap();
        assert!(Arc::ptr_eq(&front, &b));
        let next = list.pop_front().unwrap();
        assert!(Arc::ptr_eq(&next, &a));
        assert!(list.pop_front().is_none());
    }

    #[test]
    fn arbiter_evicts_under_pressure() {
        let resident = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::sync_channel(64);
        let handle = EvictionArbiter::spawn(
            rx,
            Arc::clone(&resident),
            0,
            0,
            Duration::from_millis(10),
            noop_event_listener(),
        )
        .unwrap();

        let desc = closed_desc(&resident);
        desc.unpin(&tx);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !desc.is_evicted() {
            assert!(Instant::now() < deadline, "descriptor was never evicted");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(resident.load(Ordering::Relaxed), 0);

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn arbiter_skips_pinned_descriptors() {
        let resident = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::sync_channel(64);
        let handle = EvictionArbiter::spawn(
            rx,
            Arc::clone(&resident),
            0,
            0,
            Duration::from_millis(10),
            noop_event_listener(),
        )
        .unwrap();

        let pinned = closed_desc(&resident);
        let unpinned = closed_desc(&resident);
        unpinned.unpin(&tx);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !unpinned.is_evicted() {
            assert!(Instant::now() < deadline, "descriptor was never evicted");
            thread::sleep(Duration::from_millis(5));
        }
        // Still pinned (creation ref count), so still resident.
        assert!(!pinned.is_evicted());
        assert_eq!(resident.load(Ordering::Relaxed), 1);

        drop(tx);
        handle.join().unwrap();
    }
}
