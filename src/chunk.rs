//! Chunks, chunk iterators, and the reference-counted chunk descriptor
//! that coordinates pinning and eviction.

use crate::encoding::{
    DeltaAccessor, DeltaEncodedChunk, DoubleDeltaAccessor, DoubleDeltaEncodedChunk, VarbitChunk,
    VarbitIterator,
};
use crate::error::StorageError;
use crate::types::{Interval, SamplePair, Timestamp, EARLIEST, ZERO_SAMPLE_PAIR};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, Weak};

/// The length of a chunk in bytes. Every encoding marshals to exactly this
/// many bytes; unused tail bytes are undefined.
pub const CHUNK_LEN: usize = 1024;

/// Identifies a chunk encoding. The tag is the first byte of the
/// marshalled form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Delta = 0,
    DoubleDelta = 1,
    Varbit = 2,
}

impl Encoding {
    pub fn from_tag(tag: u8) -> Result<Encoding, StorageError> {
        match tag {
            0 => Ok(Encoding::Delta),
            1 => Ok(Encoding::DoubleDelta),
            2 => Ok(Encoding::Varbit),
            other => Err(StorageError::InvalidEncoding(other)),
        }
    }
}

/// A fixed-capacity block of encoded samples for one series. Chunks are
/// not thread-safe; concurrent access is coordinated by the owning
/// [`ChunkDesc`].
#[derive(Debug, Clone)]
pub enum Chunk {
    Delta(DeltaEncodedChunk),
    DoubleDelta(DoubleDeltaEncodedChunk),
    Varbit(VarbitChunk),
}

impl Chunk {
    /// Creates an empty chunk of the given encoding with its initial field
    /// widths.
    pub fn new(encoding: Encoding) -> Chunk {
        match encoding {
            Encoding::Delta => Chunk::Delta(DeltaEncodedChunk::new(1, 0, true)),
            // Zero-width fields: a perfectly regular series stores no body
            // bytes until a delta-of-delta forces widening.
            Encoding::DoubleDelta => Chunk::DoubleDelta(DoubleDeltaEncodedChunk::new(0, 0, true)),
            Encoding::Varbit => Chunk::Varbit(VarbitChunk::new()),
        }
    }

    /// Adds a sample, performing any necessary re-encoding and spilling
    /// into overflow chunks. Returns the new version of this chunk,
    /// followed by overflow chunks, if any; the last element is the chunk
    /// to continue writing into. The receiver is consumed and must be
    /// replaced by the returned chunks.
    pub fn add(self, s: SamplePair) -> Result<Vec<Chunk>, StorageError> {
        match self {
            Chunk::Delta(c) => c.add(s),
            Chunk::DoubleDelta(c) => c.add(s),
            Chunk::Varbit(c) => c.add(s),
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Chunk::Delta(_) => Encoding::Delta,
            Chunk::DoubleDelta(_) => Encoding::DoubleDelta,
            Chunk::Varbit(_) => Encoding::Varbit,
        }
    }

    /// The timestamp of the first sample. Meaningless on an empty chunk.
    pub fn first_time(&self) -> Timestamp {
        match self {
            Chunk::Delta(c) => c.first_time(),
            Chunk::DoubleDelta(c) => c.first_time(),
            Chunk::Varbit(c) => c.first_time(),
        }
    }

    /// Number of samples in the chunk.
    pub fn len(&self) -> usize {
        match self {
            Chunk::Delta(c) => c.len(),
            Chunk::DoubleDelta(c) => c.len(),
            Chunk::Varbit(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn new_iterator(&self) -> ChunkIterator<'_> {
        ChunkIterator {
            inner: match self {
                Chunk::Delta(c) => IterInner::Delta(IndexedIterator::new(DeltaAccessor::new(c))),
                Chunk::DoubleDelta(c) => {
                    IterInner::DoubleDelta(IndexedIterator::new(DoubleDeltaAccessor::new(c)))
                }
                Chunk::Varbit(c) => IterInner::Varbit(VarbitIterator::new(c)),
            },
        }
    }

    /// Marshals the chunk to exactly [`CHUNK_LEN`] bytes.
    pub fn marshal(&self) -> Result<Vec<u8>, StorageError> {
        match self {
            Chunk::Delta(c) => c.marshal(),
            Chunk::DoubleDelta(c) => c.marshal(),
            Chunk::Varbit(c) => c.marshal(),
        }
    }

    /// Unmarshals a chunk from its [`CHUNK_LEN`]-byte marshalled form.
    pub fn unmarshal(data: &[u8]) -> Result<Chunk, StorageError> {
        if data.len() != CHUNK_LEN {
            return Err(StorageError::corruption(format!(
                "chunk must be exactly {} bytes, got {}",
                CHUNK_LEN,
                data.len()
            )));
        }
        match Encoding::from_tag(data[0])? {
            Encoding::Delta => Ok(Chunk::Delta(DeltaEncodedChunk::unmarshal(data)?)),
            Encoding::DoubleDelta => {
                Ok(Chunk::DoubleDelta(DoubleDeltaEncodedChunk::unmarshal(data)?))
            }
            Encoding::Varbit => Ok(Chunk::Varbit(VarbitChunk::unmarshal(data)?)),
        }
    }
}

/// Creates a fresh overflow chunk of the same encoding as the full chunk
/// `c`, adds `s` to it, and returns `c` followed by the overflow chunk(s).
pub(crate) fn add_to_overflow_chunk(c: Chunk, s: SamplePair) -> Result<Vec<Chunk>, StorageError> {
    let mut overflow = Chunk::new(c.encoding()).add(s)?;
    let mut out = Vec::with_capacity(1 + overflow.len());
    out.push(c);
    out.append(&mut overflow);
    Ok(out)
}

/// Replays every sample of `src` into `dst` (following overflow chains)
/// and then adds `s`. Returns the transcoded chunks with the new sample at
/// the end.
pub(crate) fn transcode_and_add(
    dst: Chunk,
    src: Chunk,
    s: SamplePair,
) -> Result<Vec<Chunk>, StorageError> {
    let mut out = Vec::new();
    let mut head = dst;
    {
        let mut it = src.new_iterator();
        while it.scan() {
            let mut chunks = head.add(it.value())?;
            let new_head = chunks.pop().expect("codec add returned no chunks");
            out.append(&mut chunks);
            head = new_head;
        }
        if let Some(e) = it.err() {
            return Err(e);
        }
    }
    let mut chunks = head.add(s)?;
    out.append(&mut chunks);
    Ok(out)
}

// --- Chunk iterator ---

/// Access to samples of an encoded chunk by position.
pub(crate) trait IndexAccessor {
    fn timestamp_at(&mut self, i: usize) -> Timestamp;
    fn value_at(&mut self, i: usize) -> f64;
    fn len(&self) -> usize;
    fn err(&self) -> Option<&StorageError>;
}

/// Positional iterator over any chunk with an [`IndexAccessor`].
pub(crate) struct IndexedIterator<A: IndexAccessor> {
    acc: A,
    pos: isize,
    last: SamplePair,
}

impl<A: IndexAccessor> IndexedIterator<A> {
    fn new(acc: A) -> Self {
        IndexedIterator {
            acc,
            pos: -1,
            last: ZERO_SAMPLE_PAIR,
        }
    }

    fn scan(&mut self) -> bool {
        self.pos += 1;
        if self.pos as usize >= self.acc.len() {
            return false;
        }
        self.position(self.pos as usize)
    }

    fn find_at_or_before(&mut self, t: Timestamp) -> bool {
        let i = self.search(|ts| ts > t);
        if i == 0 || self.acc.err().is_some() {
            return false;
        }
        self.position(i - 1)
    }

    fn find_at_or_after(&mut self, t: Timestamp) -> bool {
        let i = self.search(|ts| ts >= t);
        if i == self.acc.len() || self.acc.err().is_some() {
            return false;
        }
        self.position(i)
    }

    fn position(&mut self, i: usize) -> bool {
        self.pos = i as isize;
        self.last = SamplePair {
            timestamp: self.acc.timestamp_at(i),
            value: self.acc.value_at(i),
        };
        self.acc.err().is_none()
    }

    // Least index whose timestamp satisfies `pred`, which must be monotone
    // over the ascending timestamps. Returns len if no index satisfies it.
    fn search(&mut self, pred: impl Fn(Timestamp) -> bool) -> usize {
        let mut lo = 0usize;
        let mut hi = self.acc.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.acc.timestamp_at(mid)) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    fn contains(&mut self, t: Timestamp) -> Result<bool, StorageError> {
        let len = self.acc.len();
        if len == 0 {
            return Ok(false);
        }
        let first = self.acc.timestamp_at(0);
        let last = self.acc.timestamp_at(len - 1);
        match self.acc.err() {
            Some(e) => Err(e.clone()),
            None => Ok(first <= t && t <= last),
        }
    }

    fn last_timestamp(&mut self) -> Result<Timestamp, StorageError> {
        let len = self.acc.len();
        if len == 0 {
            return Ok(EARLIEST);
        }
        let t = self.acc.timestamp_at(len - 1);
        match self.acc.err() {
            Some(e) => Err(e.clone()),
            None => Ok(t),
        }
    }
}

enum IterInner<'a> {
    Delta(IndexedIterator<DeltaAccessor<'a>>),
    DoubleDelta(IndexedIterator<DoubleDeltaAccessor<'a>>),
    Varbit(VarbitIterator<'a>),
}

/// Iterator over the samples of one chunk. Not for use concurrently with
/// chunk mutation.
pub struct ChunkIterator<'a> {
    inner: IterInner<'a>,
}

impl ChunkIterator<'_> {
    /// Advances the cursor by one position. Directly after creation the
    /// next value is the first in the chunk. Returns false at the end of
    /// the chunk or on error.
    pub fn scan(&mut self) -> bool {
        match &mut self.inner {
            IterInner::Delta(it) => it.scan(),
            IterInner::DoubleDelta(it) => it.scan(),
            IterInner::Varbit(it) => it.scan(),
        }
    }

    /// Positions at the most recent sample at or before `t`. Returns false
    /// if no such sample exists or an error occurred.
    pub fn find_at_or_before(&mut self, t: Timestamp) -> bool {
        match &mut self.inner {
            IterInner::Delta(it) => it.find_at_or_before(t),
            IterInner::DoubleDelta(it) => it.find_at_or_before(t),
            IterInner::Varbit(it) => it.find_at_or_before(t),
        }
    }

    /// Positions at the oldest sample at or after `t`. Returns false if no
    /// such sample exists or an error occurred.
    pub fn find_at_or_after(&mut self, t: Timestamp) -> bool {
        match &mut self.inner {
            IterInner::Delta(it) => it.find_at_or_after(t),
            IterInner::DoubleDelta(it) => it.find_at_or_after(t),
            IterInner::Varbit(it) => it.find_at_or_after(t),
        }
    }

    /// Whether `t` lies between the first and last sample, inclusive.
    pub fn contains(&mut self, t: Timestamp) -> Result<bool, StorageError> {
        match &mut self.inner {
            IterInner::Delta(it) => it.contains(t),
            IterInner::DoubleDelta(it) => it.contains(t),
            IterInner::Varbit(it) => Ok(it.contains(t)),
        }
    }

    /// The timestamp of the last sample in the chunk.
    pub fn last_timestamp(&mut self) -> Result<Timestamp, StorageError> {
        match &mut self.inner {
            IterInner::Delta(it) => it.last_timestamp(),
            IterInner::DoubleDelta(it) => it.last_timestamp(),
            IterInner::Varbit(it) => Ok(it.last_timestamp()),
        }
    }

    /// The last sample scanned or found. Before any successful positioning
    /// call this is the zero pair with the earliest sentinel timestamp.
    pub fn value(&self) -> SamplePair {
        match &self.inner {
            IterInner::Delta(it) => it.last,
            IterInner::DoubleDelta(it) => it.last,
            IterInner::Varbit(it) => it.value(),
        }
    }

    /// The last error encountered. A decode error signals corruption and
    /// invalidates all prior and future positioning.
    pub fn err(&self) -> Option<StorageError> {
        match &self.inner {
            IterInner::Delta(it) => it.acc.err().cloned(),
            IterInner::DoubleDelta(it) => it.acc.err().cloned(),
            IterInner::Varbit(it) => it.err(),
        }
    }
}

/// Retrieves all values within the inclusive interval from a chunk
/// iterator.
pub fn range_values(
    it: &mut ChunkIterator<'_>,
    interval: Interval,
) -> Result<Vec<SamplePair>, StorageError> {
    let mut result = Vec::new();
    if !it.find_at_or_after(interval.oldest_inclusive) {
        return match it.err() {
            Some(e) => Err(e),
            None => Ok(result),
        };
    }
    while it.value().timestamp <= interval.newest_inclusive {
        result.push(it.value());
        if !it.scan() {
            break;
        }
    }
    match it.err() {
        Some(e) => Err(e),
        None => Ok(result),
    }
}

// --- Chunk descriptor ---

/// A request to the eviction arbiter. `evict: false` asks for the
/// descriptor's removal from the LRU list (its pin count rose from zero);
/// `evict: true` appends it at the back (its pin count fell to zero).
#[derive(Debug)]
pub struct EvictRequest {
    pub desc: Arc<ChunkDesc>,
    pub evict: bool,
}

#[derive(Debug)]
struct DescState {
    chunk: Option<Chunk>,
    ref_count: u32,
}

/// Metadata handle around a possibly-evicted chunk.
///
/// Two method families with distinct concurrency contracts:
///
/// Everything touching pinning or eviction takes the descriptor's own
/// mutex and can be called at any time: [`pin`](Self::pin),
/// [`unpin`](Self::unpin), [`ref_count`](Self::ref_count),
/// [`is_evicted`](Self::is_evicted), [`maybe_evict`](Self::maybe_evict).
///
/// Methods acting on the underlying chunk require the caller to hold the
/// owning series' lock and to have pinned the chunk (or to hold the sole
/// reference during creation): [`add`](Self::add),
/// [`maybe_populate_last_time`](Self::maybe_populate_last_time),
/// [`set_chunk`](Self::set_chunk), [`last_time`](Self::last_time). These
/// share the mutex for memory safety, but the caller contract is what
/// keeps their sequencing meaningful.
///
/// [`first_time`](Self::first_time) is immutable after creation and needs
/// no synchronization.
#[derive(Debug)]
pub struct ChunkDesc {
    // Handle on ourselves for building evict requests; always upgradable
    // while a method runs.
    self_ref: Weak<ChunkDesc>,
    state: Mutex<DescState>,
    first_time: Timestamp,
    // EARLIEST until the chunk closes, then the true last timestamp.
    last_time: AtomicI64,
    // Shared gauge of resident chunks, maintained across creation,
    // eviction, chunk installation, and drop.
    resident: Arc<AtomicUsize>,
}

impl ChunkDesc {
    /// Creates a descriptor for a freshly created chunk. The chunk is not
    /// persisted anywhere yet, so the descriptor starts with a ref count
    /// of 1, preventing eviction before the creator pins or persists it.
    pub fn new(chunk: Chunk, resident: Arc<AtomicUsize>) -> Arc<ChunkDesc> {
        let first_time = chunk.first_time();
        resident.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| ChunkDesc {
            self_ref: weak.clone(),
            state: Mutex::new(DescState {
                chunk: Some(chunk),
                ref_count: 1,
            }),
            first_time,
            last_time: AtomicI64::new(EARLIEST),
            resident,
        })
    }

    fn request(&self, evict_requests: &SyncSender<EvictRequest>, evict: bool) {
        if let Some(desc) = self.self_ref.upgrade() {
            let _ = evict_requests.send(EvictRequest { desc, evict });
        }
    }

    /// Increments the ref count. On the 0 -> 1 transition a removal
    /// request is sent to the eviction arbiter.
    pub fn pin(&self, evict_requests: &SyncSender<EvictRequest>) {
        let mut state = self.state.lock().expect("chunk descriptor mutex");
        if state.ref_count == 0 {
            self.request(evict_requests, false);
        }
        state.ref_count += 1;
    }

    /// Decrements the ref count. On the 1 -> 0 transition the descriptor
    /// is queued at the back of the eviction list. Unpinning an unpinned
    /// descriptor is a programming error.
    pub fn unpin(&self, evict_requests: &SyncSender<EvictRequest>) {
        let mut state = self.state.lock().expect("chunk descriptor mutex");
        if state.ref_count == 0 {
            panic!("cannot unpin already unpinned chunk");
        }
        state.ref_count -= 1;
        if state.ref_count == 0 {
            self.request(evict_requests, true);
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().expect("chunk descriptor mutex").ref_count
    }

    pub fn is_evicted(&self) -> bool {
        self.state
            .lock()
            .expect("chunk descriptor mutex")
            .chunk
            .is_none()
    }

    /// The timestamp of the first sample in the chunk. Populated at
    /// creation, immutable afterwards.
    pub fn first_time(&self) -> Timestamp {
        self.first_time
    }

    /// The timestamp of the last sample. Cheap once the chunk has closed;
    /// before that it is read from the chunk itself, so the chunk-family
    /// caller contract applies.
    pub fn last_time(&self) -> Result<Timestamp, StorageError> {
        let cached = self.last_time.load(Ordering::Acquire);
        if cached != EARLIEST {
            return Ok(cached);
        }
        let state = self.state.lock().expect("chunk descriptor mutex");
        match &state.chunk {
            None => Ok(EARLIEST),
            Some(chunk) => {
                let mut it = chunk.new_iterator();
                it.last_timestamp()
            }
        }
    }

    /// Populates the cached last time from the chunk if that has not
    /// happened yet. Call directly after adding the final sample to a
    /// chunk, or after closing a head chunk.
    pub fn maybe_populate_last_time(&self) -> Result<(), StorageError> {
        if self.last_time.load(Ordering::Acquire) != EARLIEST {
            return Ok(());
        }
        let state = self.state.lock().expect("chunk descriptor mutex");
        if let Some(chunk) = &state.chunk {
            let mut it = chunk.new_iterator();
            let t = it.last_timestamp()?;
            self.last_time.store(t, Ordering::Release);
        }
        Ok(())
    }

    /// Adds a sample to the underlying chunk. The descriptor keeps the
    /// first returned chunk as its payload; any overflow chunks are
    /// returned for the caller to wrap in new descriptors. Calling this on
    /// an evicted descriptor is a programming error.
    pub fn add(&self, s: SamplePair) -> Result<Vec<Chunk>, StorageError> {
        let mut state = self.state.lock().expect("chunk descriptor mutex");
        let chunk = state.chunk.take().expect("add on evicted chunk");
        let mut chunks = chunk.add(s)?;
        let rest = chunks.split_off(1);
        state.chunk = chunks.pop();
        Ok(rest)
    }

    /// Installs a chunk payload, e.g. after a persistence layer reloads an
    /// evicted chunk. Installing over a resident chunk is a programming
    /// error.
    pub fn set_chunk(&self, chunk: Chunk) {
        let mut state = self.state.lock().expect("chunk descriptor mutex");
        if state.chunk.is_some() {
            panic!("chunk already set");
        }
        state.chunk = Some(chunk);
        self.resident.fetch_add(1, Ordering::Relaxed);
    }

    /// Evicts the chunk payload if the ref count is zero. Returns whether
    /// the chunk is now evicted, including the case that it already was.
    /// Evicting a still-open chunk (no populated last time) is a
    /// programming error.
    pub fn maybe_evict(&self) -> bool {
        let mut state = self.state.lock().expect("chunk descriptor mutex");
        if state.chunk.is_none() {
            return true;
        }
        if state.ref_count != 0 {
            return false;
        }
        if self.last_time.load(Ordering::Acquire) == EARLIEST {
            panic!("cannot evict chunk whose last time is not populated");
        }
        state.chunk = None;
        self.resident.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Runs `f` against the resident chunk, or returns None if evicted.
    /// The caller must have pinned the descriptor so the payload cannot be
    /// evicted between the residency check and the read.
    pub(crate) fn with_chunk<R>(&self, f: impl FnOnce(&Chunk) -> R) -> Option<R> {
        let state = self.state.lock().expect("chunk descriptor mutex");
        state.chunk.as_ref().map(f)
    }
}

impl Drop for ChunkDesc {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.chunk.is_some() {
            self.resident.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
