//! Chunk codecs: Delta, DoubleDelta, and the bit-packed Varbit encoding.
//!
//! All three encode ordered (timestamp, value) pairs into fixed-capacity
//! 1 KiB chunks. Every value path verifies at encode time that decoding
//! reproduces the stored value bit-exactly, widening field widths (or
//! falling back to absolute storage) where delta arithmetic would not
//! round-trip.

use crate::chunk::{add_to_overflow_chunk, transcode_and_add, Chunk, Encoding, IndexAccessor, CHUNK_LEN};
use crate::error::StorageError;
use crate::types::{SamplePair, Timestamp, EARLIEST, ZERO_SAMPLE_PAIR};

pub(crate) const DELTA_HEADER_LEN: usize = 22;
pub(crate) const DOUBLE_DELTA_HEADER_LEN: usize = 38;
pub(crate) const VARBIT_HEADER_LEN: usize = 56;

/// Bit capacity of a varbit chunk body.
pub(crate) const VARBIT_MAX_BITS: u32 = ((CHUNK_LEN - VARBIT_HEADER_LEN) * 8) as u32;

// --- Width planning helpers ---

/// Whether `v` survives a round-trip through i64 unchanged.
#[inline]
fn is_int64_value(v: f64) -> bool {
    v == ((v as i64) as f64)
}

fn needed_time_width(dt: u64) -> u8 {
    if dt <= u64::from(u8::MAX) {
        1
    } else if dt <= u64::from(u16::MAX) {
        2
    } else if dt <= u64::from(u32::MAX) {
        4
    } else {
        8
    }
}

fn needed_signed_width(v: i64) -> u8 {
    if v == 0 {
        0
    } else if i64::from(v as i8) == v {
        1
    } else if i64::from(v as i16) == v {
        2
    } else if i64::from(v as i32) == v {
        4
    } else {
        8
    }
}

/// Plans the value width for a delta stored against `reference`. Returns
/// `(width, is_int)`. The integer path is only taken when adding the
/// truncated delta back onto the reference reproduces `v` bit-exactly;
/// likewise the 4-byte float path requires an exact f32 round-trip. The
/// 8-byte float width stores the absolute value and is always exact.
fn plan_value_width(reference: f64, v: f64, currently_int: bool) -> (u8, bool) {
    let dv = v - reference;
    if currently_int && is_int64_value(dv) {
        let dvi = dv as i64;
        if (reference + dvi as f64).to_bits() == v.to_bits() {
            return (needed_signed_width(dvi), true);
        }
    }
    if (reference + f64::from(dv as f32)).to_bits() == v.to_bits() {
        (4, false)
    } else {
        (8, false)
    }
}

// --- Delta encoding ---

/// Stores each sample as a (timestamp delta, value delta) pair against the
/// first sample, at fixed per-chunk field widths.
#[derive(Debug, Clone)]
pub struct DeltaEncodedChunk {
    time_width: u8,
    value_width: u8,
    value_is_int: bool,
    base_time: Timestamp,
    base_value: f64,
    body: Vec<u8>,
}

impl DeltaEncodedChunk {
    pub(crate) fn new(time_width: u8, value_width: u8, value_is_int: bool) -> Self {
        DeltaEncodedChunk {
            time_width,
            value_width,
            value_is_int,
            base_time: 0,
            base_value: 0.0,
            body: Vec::new(),
        }
    }

    fn sample_size(&self) -> usize {
        usize::from(self.time_width) + usize::from(self.value_width)
    }

    pub(crate) fn len(&self) -> usize {
        self.body.len() / self.sample_size()
    }

    pub(crate) fn first_time(&self) -> Timestamp {
        self.base_time
    }

    pub(crate) fn add(mut self, s: SamplePair) -> Result<Vec<Chunk>, StorageError> {
        if self.len() == 0 {
            self.base_time = s.timestamp;
            self.base_value = s.value;
        }
        if self.len() >= usize::from(u16::MAX)
            || DELTA_HEADER_LEN + self.body.len() + self.sample_size() > CHUNK_LEN
        {
            return add_to_overflow_chunk(Chunk::Delta(self), s);
        }
        let dt = s.timestamp - self.base_time;
        if dt < 0 {
            return Err(StorageError::corruption(
                "delta sample timestamp before chunk base time",
            ));
        }
        let needed_tw = needed_time_width(dt as u64).max(self.time_width);
        let (planned_vw, value_is_int) = plan_value_width(self.base_value, s.value, self.value_is_int);
        if needed_tw > self.time_width
            || value_is_int != self.value_is_int
            || planned_vw > self.value_width
        {
            let target_vw = if value_is_int == self.value_is_int {
                planned_vw.max(self.value_width)
            } else {
                planned_vw
            };
            let target = DeltaEncodedChunk::new(needed_tw, target_vw, value_is_int);
            return transcode_and_add(Chunk::Delta(target), Chunk::Delta(self), s);
        }
        self.push_time_delta(dt as u64);
        self.push_value(s.value - self.base_value, s.value);
        Ok(vec![Chunk::Delta(self)])
    }

    fn push_time_delta(&mut self, dt: u64) {
        match self.time_width {
            1 => self.body.push(dt as u8),
            2 => self.body.extend_from_slice(&(dt as u16).to_le_bytes()),
            4 => self.body.extend_from_slice(&(dt as u32).to_le_bytes()),
            _ => self.body.extend_from_slice(&dt.to_le_bytes()),
        }
    }

    fn push_value(&mut self, dv: f64, v: f64) {
        if self.value_is_int {
            let dvi = dv as i64;
            match self.value_width {
                0 => {}
                1 => self.body.extend_from_slice(&(dvi as i8).to_le_bytes()),
                2 => self.body.extend_from_slice(&(dvi as i16).to_le_bytes()),
                4 => self.body.extend_from_slice(&(dvi as i32).to_le_bytes()),
                _ => self.body.extend_from_slice(&dvi.to_le_bytes()),
            }
        } else {
            match self.value_width {
                4 => self.body.extend_from_slice(&(dv as f32).to_le_bytes()),
                // Width 8 stores the absolute value so decoding is exact.
                _ => self.body.extend_from_slice(&v.to_le_bytes()),
            }
        }
    }

    fn timestamp_at(&self, i: usize) -> Option<Timestamp> {
        let off = i * self.sample_size();
        let b = self.body.get(off..off + usize::from(self.time_width))?;
        let dt = match self.time_width {
            1 => u64::from(b[0]),
            2 => u64::from(u16::from_le_bytes([b[0], b[1]])),
            4 => u64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                u64::from_le_bytes(raw)
            }
        };
        Some(self.base_time + dt as i64)
    }

    fn value_at(&self, i: usize) -> Option<f64> {
        let off = i * self.sample_size() + usize::from(self.time_width);
        let b = self.body.get(off..off + usize::from(self.value_width))?;
        if self.value_is_int {
            let dvi = match self.value_width {
                0 => 0,
                1 => i64::from(b[0] as i8),
                2 => i64::from(i16::from_le_bytes([b[0], b[1]])),
                4 => i64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                _ => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    i64::from_le_bytes(raw)
                }
            };
            Some(self.base_value + dvi as f64)
        } else {
            match self.value_width {
                4 => Some(self.base_value + f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))),
                _ => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    Some(f64::from_le_bytes(raw))
                }
            }
        }
    }

    pub(crate) fn marshal(&self) -> Result<Vec<u8>, StorageError> {
        if DELTA_HEADER_LEN + self.body.len() > CHUNK_LEN {
            return Err(StorageError::ChunkBoundsExceeded);
        }
        let mut buf = vec![0u8; CHUNK_LEN];
        buf[0] = Encoding::Delta as u8;
        buf[1] = self.time_width;
        buf[2] = self.value_width;
        buf[3] = u8::from(self.value_is_int);
        buf[4..6].copy_from_slice(&(self.len() as u16).to_le_bytes());
        buf[6..14].copy_from_slice(&self.base_time.to_le_bytes());
        buf[14..22].copy_from_slice(&self.base_value.to_le_bytes());
        buf[DELTA_HEADER_LEN..DELTA_HEADER_LEN + self.body.len()].copy_from_slice(&self.body);
        Ok(buf)
    }

    pub(crate) fn unmarshal(data: &[u8]) -> Result<DeltaEncodedChunk, StorageError> {
        let time_width = data[1];
        let value_width = data[2];
        if !matches!(time_width, 1 | 2 | 4 | 8) || !matches!(value_width, 0 | 1 | 2 | 4 | 8) {
            return Err(StorageError::corruption("invalid delta chunk field widths"));
        }
        let value_is_int = match data[3] {
            0 => false,
            1 => true,
            _ => return Err(StorageError::corruption("invalid delta chunk value flag")),
        };
        let count = usize::from(u16::from_le_bytes([data[4], data[5]]));
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[6..14]);
        let base_time = i64::from_le_bytes(raw);
        raw.copy_from_slice(&data[14..22]);
        let base_value = f64::from_le_bytes(raw);
        let body_len = count * (usize::from(time_width) + usize::from(value_width));
        if DELTA_HEADER_LEN + body_len > CHUNK_LEN {
            return Err(StorageError::corruption(
                "delta chunk sample count exceeds capacity",
            ));
        }
        Ok(DeltaEncodedChunk {
            time_width,
            value_width,
            value_is_int,
            base_time,
            base_value,
            body: data[DELTA_HEADER_LEN..DELTA_HEADER_LEN + body_len].to_vec(),
        })
    }
}

pub(crate) struct DeltaAccessor<'a> {
    chunk: &'a DeltaEncodedChunk,
    err: Option<StorageError>,
}

impl<'a> DeltaAccessor<'a> {
    pub(crate) fn new(chunk: &'a DeltaEncodedChunk) -> Self {
        DeltaAccessor { chunk, err: None }
    }
}

impl IndexAccessor for DeltaAccessor<'_> {
    fn timestamp_at(&mut self, i: usize) -> Timestamp {
        match self.chunk.timestamp_at(i) {
            Some(t) => t,
            None => {
                self.err = Some(StorageError::ChunkBoundsExceeded);
                EARLIEST
            }
        }
    }

    fn value_at(&mut self, i: usize) -> f64 {
        match self.chunk.value_at(i) {
            Some(v) => v,
            None => {
                self.err = Some(StorageError::ChunkBoundsExceeded);
                0.0
            }
        }
    }

    fn len(&self) -> usize {
        self.chunk.len()
    }

    fn err(&self) -> Option<&StorageError> {
        self.err.as_ref()
    }
}

// --- DoubleDelta encoding ---

/// Stores delta-of-delta corrections against linear extrapolation from the
/// first sample and first delta. On regular-cadence series the corrections
/// are zero and occupy zero bytes. Samples 0 and 1 live in the header.
#[derive(Debug, Clone)]
pub struct DoubleDeltaEncodedChunk {
    time_width: u8,
    value_width: u8,
    value_is_int: bool,
    count: u16,
    base_time: Timestamp,
    base_value: f64,
    base_time_delta: i64,
    base_value_delta: f64,
    body: Vec<u8>,
}

impl DoubleDeltaEncodedChunk {
    pub(crate) fn new(time_width: u8, value_width: u8, value_is_int: bool) -> Self {
        DoubleDeltaEncodedChunk {
            time_width,
            value_width,
            value_is_int,
            count: 0,
            base_time: 0,
            base_value: 0.0,
            base_time_delta: 0,
            base_value_delta: 0.0,
            body: Vec::new(),
        }
    }

    fn sample_size(&self) -> usize {
        usize::from(self.time_width) + usize::from(self.value_width)
    }

    pub(crate) fn len(&self) -> usize {
        usize::from(self.count)
    }

    pub(crate) fn first_time(&self) -> Timestamp {
        self.base_time
    }

    fn expected_timestamp(&self, i: i64) -> Option<Timestamp> {
        self.base_time.checked_add(i.checked_mul(self.base_time_delta)?)
    }

    fn expected_value(&self, i: i64) -> f64 {
        self.base_value + i as f64 * self.base_value_delta
    }

    pub(crate) fn add(mut self, s: SamplePair) -> Result<Vec<Chunk>, StorageError> {
        match self.count {
            0 => {
                self.base_time = s.timestamp;
                self.base_value = s.value;
                self.count = 1;
                Ok(vec![Chunk::DoubleDelta(self)])
            }
            1 => {
                let dt = s.timestamp - self.base_time;
                if dt < 0 {
                    return Err(StorageError::corruption(
                        "double-delta sample timestamp before chunk base time",
                    ));
                }
                let dv = s.value - self.base_value;
                if (self.base_value + dv).to_bits() != s.value.to_bits() {
                    // No width can make base + delta reproduce this value;
                    // store both samples absolutely in a wide delta chunk.
                    let target = DeltaEncodedChunk::new(8, 8, false);
                    return transcode_and_add(Chunk::Delta(target), Chunk::DoubleDelta(self), s);
                }
                self.base_time_delta = dt;
                self.base_value_delta = dv;
                self.count = 2;
                Ok(vec![Chunk::DoubleDelta(self)])
            }
            _ => {
                if self.count == u16::MAX
                    || DOUBLE_DELTA_HEADER_LEN + self.body.len() + self.sample_size() > CHUNK_LEN
                {
                    return add_to_overflow_chunk(Chunk::DoubleDelta(self), s);
                }
                let idx = i64::from(self.count);
                let expected_t = self.expected_timestamp(idx).ok_or_else(|| {
                    StorageError::corruption("double-delta timestamp extrapolation overflow")
                })?;
                let dod_t = s.timestamp - expected_t;
                let expected_v = self.expected_value(idx);
                let needed_tw = needed_signed_width(dod_t).max(self.time_width);
                let (planned_vw, value_is_int) =
                    plan_value_width(expected_v, s.value, self.value_is_int);
                if needed_tw > self.time_width
                    || value_is_int != self.value_is_int
                    || planned_vw > self.value_width
                {
                    let target_vw = if value_is_int == self.value_is_int {
                        planned_vw.max(self.value_width)
                    } else {
                        planned_vw
                    };
                    let target = DoubleDeltaEncodedChunk::new(needed_tw, target_vw, value_is_int);
                    return transcode_and_add(
                        Chunk::DoubleDelta(target),
                        Chunk::DoubleDelta(self),
                        s,
                    );
                }
                self.push_time_dod(dod_t);
                self.push_value_dod(s.value - expected_v, s.value);
                self.count += 1;
                Ok(vec![Chunk::DoubleDelta(self)])
            }
        }
    }

    fn push_time_dod(&mut self, dod: i64) {
        match self.time_width {
            0 => {}
            1 => self.body.extend_from_slice(&(dod as i8).to_le_bytes()),
            2 => self.body.extend_from_slice(&(dod as i16).to_le_bytes()),
            4 => self.body.extend_from_slice(&(dod as i32).to_le_bytes()),
            _ => self.body.extend_from_slice(&dod.to_le_bytes()),
        }
    }

    fn push_value_dod(&mut self, dod: f64, v: f64) {
        if self.value_is_int {
            let dodi = dod as i64;
            match self.value_width {
                0 => {}
                1 => self.body.extend_from_slice(&(dodi as i8).to_le_bytes()),
                2 => self.body.extend_from_slice(&(dodi as i16).to_le_bytes()),
                4 => self.body.extend_from_slice(&(dodi as i32).to_le_bytes()),
                _ => self.body.extend_from_slice(&dodi.to_le_bytes()),
            }
        } else {
            match self.value_width {
                4 => self.body.extend_from_slice(&(dod as f32).to_le_bytes()),
                _ => self.body.extend_from_slice(&v.to_le_bytes()),
            }
        }
    }

    fn timestamp_at(&self, i: usize) -> Option<Timestamp> {
        match i {
            0 => Some(self.base_time),
            1 => Some(self.base_time + self.base_time_delta),
            _ => {
                if i >= self.len() {
                    return None;
                }
                let off = (i - 2) * self.sample_size();
                let b = self.body.get(off..off + usize::from(self.time_width))?;
                let dod = match self.time_width {
                    0 => 0,
                    1 => i64::from(b[0] as i8),
                    2 => i64::from(i16::from_le_bytes([b[0], b[1]])),
                    4 => i64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                    _ => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(b);
                        i64::from_le_bytes(raw)
                    }
                };
                Some(self.expected_timestamp(i as i64)? + dod)
            }
        }
    }

    fn value_at(&self, i: usize) -> Option<f64> {
        match i {
            0 => Some(self.base_value),
            1 => Some(self.base_value + self.base_value_delta),
            _ => {
                if i >= self.len() {
                    return None;
                }
                let off = (i - 2) * self.sample_size() + usize::from(self.time_width);
                let b = self.body.get(off..off + usize::from(self.value_width))?;
                let expected = self.expected_value(i as i64);
                if self.value_is_int {
                    let dodi = match self.value_width {
                        0 => 0,
                        1 => i64::from(b[0] as i8),
                        2 => i64::from(i16::from_le_bytes([b[0], b[1]])),
                        4 => i64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                        _ => {
                            let mut raw = [0u8; 8];
                            raw.copy_from_slice(b);
                            i64::from_le_bytes(raw)
                        }
                    };
                    Some(expected + dodi as f64)
                } else {
                    match self.value_width {
                        4 => Some(expected + f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))),
                        _ => {
                            let mut raw = [0u8; 8];
                            raw.copy_from_slice(b);
                            Some(f64::from_le_bytes(raw))
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn marshal(&self) -> Result<Vec<u8>, StorageError> {
        if DOUBLE_DELTA_HEADER_LEN + self.body.len() > CHUNK_LEN {
            return Err(StorageError::ChunkBoundsExceeded);
        }
        let mut buf = vec![0u8; CHUNK_LEN];
        buf[0] = Encoding::DoubleDelta as u8;
        buf[1] = self.time_width;
        buf[2] = self.value_width;
        buf[3] = u8::from(self.value_is_int);
        buf[4..6].copy_from_slice(&self.count.to_le_bytes());
        buf[6..14].copy_from_slice(&self.base_time.to_le_bytes());
        buf[14..22].copy_from_slice(&self.base_value.to_le_bytes());
        buf[22..30].copy_from_slice(&self.base_time_delta.to_le_bytes());
        buf[30..38].copy_from_slice(&self.base_value_delta.to_le_bytes());
        buf[DOUBLE_DELTA_HEADER_LEN..DOUBLE_DELTA_HEADER_LEN + self.body.len()]
            .copy_from_slice(&self.body);
        Ok(buf)
    }

    pub(crate) fn unmarshal(data: &[u8]) -> Result<DoubleDeltaEncodedChunk, StorageError> {
        let time_width = data[1];
        let value_width = data[2];
        if !matches!(time_width, 0 | 1 | 2 | 4 | 8) || !matches!(value_width, 0 | 1 | 2 | 4 | 8) {
            return Err(StorageError::corruption(
                "invalid double-delta chunk field widths",
            ));
        }
        let value_is_int = match data[3] {
            0 => false,
            1 => true,
            _ => {
                return Err(StorageError::corruption(
                    "invalid double-delta chunk value flag",
                ))
            }
        };
        let count = u16::from_le_bytes([data[4], data[5]]);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[6..14]);
        let base_time = i64::from_le_bytes(raw);
        raw.copy_from_slice(&data[14..22]);
        let base_value = f64::from_le_bytes(raw);
        raw.copy_from_slice(&data[22..30]);
        let base_time_delta = i64::from_le_bytes(raw);
        raw.copy_from_slice(&data[30..38]);
        let base_value_delta = f64::from_le_bytes(raw);
        let body_samples = usize::from(count).saturating_sub(2);
        let body_len = body_samples * (usize::from(time_width) + usize::from(value_width));
        if DOUBLE_DELTA_HEADER_LEN + body_len > CHUNK_LEN {
            return Err(StorageError::corruption(
                "double-delta chunk sample count exceeds capacity",
            ));
        }
        Ok(DoubleDeltaEncodedChunk {
            time_width,
            value_width,
            value_is_int,
            count,
            base_time,
            base_value,
            base_time_delta,
            base_value_delta,
            body: data[DOUBLE_DELTA_HEADER_LEN..DOUBLE_DELTA_HEADER_LEN + body_len].to_vec(),
        })
    }
}

pub(crate) struct DoubleDeltaAccessor<'a> {
    chunk: &'a DoubleDeltaEncodedChunk,
    err: Option<StorageError>,
}

impl<'a> DoubleDeltaAccessor<'a> {
    pub(crate) fn new(chunk: &'a DoubleDeltaEncodedChunk) -> Self {
        DoubleDeltaAccessor { chunk, err: None }
    }
}

impl IndexAccessor for DoubleDeltaAccessor<'_> {
    fn timestamp_at(&mut self, i: usize) -> Timestamp {
        match self.chunk.timestamp_at(i) {
            Some(t) => t,
            None => {
                self.err = Some(StorageError::ChunkBoundsExceeded);
                EARLIEST
            }
        }
    }

    fn value_at(&mut self, i: usize) -> f64 {
        match self.chunk.value_at(i) {
            Some(v) => v,
            None => {
                self.err = Some(StorageError::ChunkBoundsExceeded);
                0.0
            }
        }
    }

    fn len(&self) -> usize {
        self.chunk.len()
    }

    fn err(&self) -> Option<&StorageError> {
        self.err.as_ref()
    }
}

// --- Varbit encoding ---

/// Value sub-encoding of a varbit chunk. Upgrades flow zero -> integer ->
/// float by transcoding; a chunk never downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarbitValueEncoding {
    /// Every value equals the base value; no value bits are stored.
    Zero = 0,
    /// Values move by integral steps; signed delta-of-delta bit classes.
    Integer = 1,
    /// XOR compression with a leading/trailing-zero reuse window.
    Float = 2,
}

const XOR_WINDOW_UNSET: u8 = 0xff;

/// Bit-packed chunk, MSB-first within each byte. Timestamps are stored as
/// delta-of-delta in variable bit classes; value bits depend on the
/// sub-encoding. Sample positions are not addressable by index, so
/// iteration is strictly sequential.
#[derive(Debug, Clone)]
pub struct VarbitChunk {
    value_encoding: VarbitValueEncoding,
    count: u16,
    base_time: Timestamp,
    base_value: f64,
    // Append state, persisted in the header so an unmarshalled chunk can
    // keep accepting samples.
    last_time: Timestamp,
    last_time_delta: i64,
    last_value: f64,
    last_value_delta: i64,
    leading: u8,
    trailing: u8,
    bits: BitBuf,
}

#[derive(Debug, Clone, Default)]
struct BitBuf {
    bytes: Vec<u8>,
    len_bits: u32,
}

impl BitBuf {
    fn push_bit(&mut self, bit: bool) {
        if self.len_bits % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            let idx = (self.len_bits / 8) as usize;
            self.bytes[idx] |= 1 << (7 - self.len_bits % 8);
        }
        self.len_bits += 1;
    }

    fn push_bits(&mut self, mut v: u64, count: u8) {
        if count == 0 {
            return;
        }
        if count < 64 {
            v &= (1u64 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit((v >> i) & 1 == 1);
        }
    }
}

struct BitCursor<'a> {
    bytes: &'a [u8],
    pos: u32,
    limit: u32,
}

impl<'a> BitCursor<'a> {
    fn new(bytes: &'a [u8], limit: u32) -> Self {
        BitCursor { bytes, pos: 0, limit }
    }

    fn read_bit(&mut self) -> Result<bool, StorageError> {
        if self.pos >= self.limit {
            return Err(StorageError::corruption("varbit bitstream exhausted"));
        }
        let byte = self.bytes[(self.pos / 8) as usize];
        let bit = byte & (1 << (7 - self.pos % 8)) != 0;
        self.pos += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, StorageError> {
        let mut out = 0u64;
        for _ in 0..count {
            out = (out << 1) | u64::from(self.read_bit()?);
        }
        Ok(out)
    }
}

fn time_dod_cost(dod: i64) -> Option<u32> {
    if dod == 0 {
        Some(1)
    } else if (-63..=64).contains(&dod) {
        Some(9)
    } else if (-255..=256).contains(&dod) {
        Some(12)
    } else if (-2047..=2048).contains(&dod) {
        Some(16)
    } else if dod >= i64::from(i32::MIN) && dod <= i64::from(i32::MAX) {
        Some(36)
    } else {
        None
    }
}

fn push_time_dod(bits: &mut BitBuf, dod: i64) {
    if dod == 0 {
        bits.push_bit(false);
    } else if (-63..=64).contains(&dod) {
        bits.push_bits(0b10, 2);
        bits.push_bits((dod + 63) as u64, 7);
    } else if (-255..=256).contains(&dod) {
        bits.push_bits(0b110, 3);
        bits.push_bits((dod + 255) as u64, 9);
    } else if (-2047..=2048).contains(&dod) {
        bits.push_bits(0b1110, 4);
        bits.push_bits((dod + 2047) as u64, 12);
    } else {
        bits.push_bits(0b1111, 4);
        bits.push_bits(u64::from(dod as i32 as u32), 32);
    }
}

fn read_time_dod(cur: &mut BitCursor<'_>) -> Result<i64, StorageError> {
    if !cur.read_bit()? {
        return Ok(0);
    }
    if !cur.read_bit()? {
        return Ok(cur.read_bits(7)? as i64 - 63);
    }
    if !cur.read_bit()? {
        return Ok(cur.read_bits(9)? as i64 - 255);
    }
    if !cur.read_bit()? {
        return Ok(cur.read_bits(12)? as i64 - 2047);
    }
    Ok(i64::from(cur.read_bits(32)? as u32 as i32))
}

fn int_dod_cost(dod: i64) -> u32 {
    if dod == 0 {
        1
    } else if (-63..=64).contains(&dod) {
        9
    } else if (-255..=256).contains(&dod) {
        12
    } else if (-2047..=2048).contains(&dod) {
        16
    } else {
        68
    }
}

fn push_int_dod(bits: &mut BitBuf, dod: i64) {
    if dod == 0 {
        bits.push_bit(false);
    } else if (-63..=64).contains(&dod) {
        bits.push_bits(0b10, 2);
        bits.push_bits((dod + 63) as u64, 7);
    } else if (-255..=256).contains(&dod) {
        bits.push_bits(0b110, 3);
        bits.push_bits((dod + 255) as u64, 9);
    } else if (-2047..=2048).contains(&dod) {
        bits.push_bits(0b1110, 4);
        bits.push_bits((dod + 2047) as u64, 12);
    } else {
        bits.push_bits(0b1111, 4);
        bits.push_bits(dod as u64, 64);
    }
}

fn read_int_dod(cur: &mut BitCursor<'_>) -> Result<i64, StorageError> {
    if !cur.read_bit()? {
        return Ok(0);
    }
    if !cur.read_bit()? {
        return Ok(cur.read_bits(7)? as i64 - 63);
    }
    if !cur.read_bit()? {
        return Ok(cur.read_bits(9)? as i64 - 255);
    }
    if !cur.read_bit()? {
        return Ok(cur.read_bits(12)? as i64 - 2047);
    }
    Ok(cur.read_bits(64)? as i64)
}

enum XorPlan {
    Same,
    Reuse { xor: u64 },
    NewWindow { xor: u64, leading: u8, trailing: u8, sigbits: u8 },
}

fn plan_xor(prev: u64, cur: u64, leading: u8, trailing: u8) -> (u32, XorPlan) {
    let xor = prev ^ cur;
    if xor == 0 {
        return (1, XorPlan::Same);
    }
    let l = xor.leading_zeros().min(63) as u8;
    let t = xor.trailing_zeros() as u8;
    let sigbits = 64 - l - t;
    if leading != XOR_WINDOW_UNSET && l >= leading && t >= trailing {
        let window_sig = 64 - leading - trailing;
        (2 + u32::from(window_sig), XorPlan::Reuse { xor })
    } else {
        (
            2 + 6 + 6 + u32::from(sigbits),
            XorPlan::NewWindow { xor, leading: l, trailing: t, sigbits },
        )
    }
}

fn read_xor(
    cur: &mut BitCursor<'_>,
    prev_bits: u64,
    leading: &mut u8,
    trailing: &mut u8,
) -> Result<u64, StorageError> {
    if !cur.read_bit()? {
        return Ok(prev_bits);
    }
    if !cur.read_bit()? {
        if *leading == XOR_WINDOW_UNSET {
            return Err(StorageError::corruption(
                "varbit XOR window reused before initialization",
            ));
        }
        let sig = 64 - *leading - *trailing;
        let significant = cur.read_bits(sig)?;
        Ok(prev_bits ^ (significant << *trailing))
    } else {
        let l = cur.read_bits(6)? as u8;
        let sig = cur.read_bits(6)? as u8 + 1;
        if u32::from(l) + u32::from(sig) > 64 {
            return Err(StorageError::corruption("invalid varbit XOR bit widths"));
        }
        let t = 64 - l - sig;
        *leading = l;
        *trailing = t;
        let significant = cur.read_bits(sig)?;
        Ok(prev_bits ^ (significant << t))
    }
}

/// Validates one integral value step. Returns the delta-of-delta to store,
/// or `None` if the step is not integral or would not decode bit-exactly.
fn integer_step(last_value: f64, last_value_delta: i64, v: f64) -> Option<i64> {
    let vd = v - last_value;
    if !is_int64_value(vd) {
        return None;
    }
    let vdod = (vd as i64).checked_sub(last_value_delta)?;
    let new_delta = last_value_delta.checked_add(vdod)?;
    if (last_value + new_delta as f64).to_bits() != v.to_bits() {
        return None;
    }
    Some(vdod)
}

impl VarbitChunk {
    pub(crate) fn new() -> Self {
        Self::with_value_encoding(VarbitValueEncoding::Zero)
    }

    fn with_value_encoding(value_encoding: VarbitValueEncoding) -> Self {
        VarbitChunk {
            value_encoding,
            count: 0,
            base_time: 0,
            base_value: 0.0,
            last_time: EARLIEST,
            last_time_delta: 0,
            last_value: 0.0,
            last_value_delta: 0,
            leading: XOR_WINDOW_UNSET,
            trailing: 0,
            bits: BitBuf::default(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        usize::from(self.count)
    }

    pub(crate) fn first_time(&self) -> Timestamp {
        self.base_time
    }

    pub(crate) fn value_encoding(&self) -> VarbitValueEncoding {
        self.value_encoding
    }

    pub(crate) fn add(mut self, s: SamplePair) -> Result<Vec<Chunk>, StorageError> {
        if self.count == 0 {
            self.base_time = s.timestamp;
            self.base_value = s.value;
            self.last_time = s.timestamp;
            self.last_value = s.value;
            self.count = 1;
            return Ok(vec![Chunk::Varbit(self)]);
        }
        if self.count == u16::MAX {
            return add_to_overflow_chunk(Chunk::Varbit(self), s);
        }
        let delta = s.timestamp - self.last_time;
        if delta < 0 {
            return Err(StorageError::corruption(
                "varbit sample timestamp before preceding sample",
            ));
        }
        let dod = delta - self.last_time_delta;
        let time_cost = match time_dod_cost(dod) {
            Some(cost) => cost,
            None => return add_to_overflow_chunk(Chunk::Varbit(self), s),
        };

        enum ValueOp {
            Zero,
            Int(i64),
            Xor(XorPlan),
        }
        let (value_cost, op) = match self.value_encoding {
            VarbitValueEncoding::Zero => {
                if s.value.to_bits() == self.base_value.to_bits() {
                    (0, ValueOp::Zero)
                } else {
                    let target =
                        if integer_step(self.last_value, self.last_value_delta, s.value).is_some() {
                            VarbitValueEncoding::Integer
                        } else {
                            VarbitValueEncoding::Float
                        };
                    return transcode_and_add(
                        Chunk::Varbit(VarbitChunk::with_value_encoding(target)),
                        Chunk::Varbit(self),
                        s,
                    );
                }
            }
            VarbitValueEncoding::Integer => {
                match integer_step(self.last_value, self.last_value_delta, s.value) {
                    Some(vdod) => (int_dod_cost(vdod), ValueOp::Int(vdod)),
                    None => {
                        return transcode_and_add(
                            Chunk::Varbit(VarbitChunk::with_value_encoding(
                                VarbitValueEncoding::Float,
                            )),
                            Chunk::Varbit(self),
                            s,
                        )
                    }
                }
            }
            VarbitValueEncoding::Float => {
                let (cost, plan) =
                    plan_xor(self.last_value.to_bits(), s.value.to_bits(), self.leading, self.trailing);
                (cost, ValueOp::Xor(plan))
            }
        };
        if self.bits.len_bits + time_cost + value_cost > VARBIT_MAX_BITS {
            return add_to_overflow_chunk(Chunk::Varbit(self), s);
        }
        push_time_dod(&mut self.bits, dod);
        match op {
            ValueOp::Zero => {}
            ValueOp::Int(vdod) => {
                push_int_dod(&mut self.bits, vdod);
                self.last_value_delta += vdod;
            }
            ValueOp::Xor(plan) => self.push_xor(plan),
        }
        self.last_time_delta += dod;
        self.last_time = s.timestamp;
        self.last_value = s.value;
        self.count += 1;
        Ok(vec![Chunk::Varbit(self)])
    }

    fn push_xor(&mut self, plan: XorPlan) {
        match plan {
            XorPlan::Same => self.bits.push_bit(false),
            XorPlan::Reuse { xor } => {
                self.bits.push_bit(true);
                self.bits.push_bit(false);
                let window_sig = 64 - self.leading - self.trailing;
                self.bits.push_bits(xor >> self.trailing, window_sig);
            }
            XorPlan::NewWindow { xor, leading, trailing, sigbits } => {
                self.bits.push_bit(true);
                self.bits.push_bit(true);
                self.bits.push_bits(u64::from(leading), 6);
                self.bits.push_bits(u64::from(sigbits - 1), 6);
                self.bits.push_bits(xor >> trailing, sigbits);
                self.leading = leading;
                self.trailing = trailing;
            }
        }
    }

    pub(crate) fn marshal(&self) -> Result<Vec<u8>, StorageError> {
        if VARBIT_HEADER_LEN + self.bits.bytes.len() > CHUNK_LEN {
            return Err(StorageError::ChunkBoundsExceeded);
        }
        let mut buf = vec![0u8; CHUNK_LEN];
        buf[0] = Encoding::Varbit as u8;
        buf[1..3].copy_from_slice(&self.count.to_le_bytes());
        buf[3] = self.value_encoding as u8;
        buf[4] = self.leading;
        buf[5] = self.trailing;
        buf[6..8].copy_from_slice(&(self.bits.len_bits as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.base_time.to_le_bytes());
        buf[16..24].copy_from_slice(&self.base_value.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_time.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_time_delta.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_value.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_value_delta.to_le_bytes());
        buf[VARBIT_HEADER_LEN..VARBIT_HEADER_LEN + self.bits.bytes.len()]
            .copy_from_slice(&self.bits.bytes);
        Ok(buf)
    }

    pub(crate) fn unmarshal(data: &[u8]) -> Result<VarbitChunk, StorageError> {
        let count = u16::from_le_bytes([data[1], data[2]]);
        let value_encoding = match data[3] {
            0 => VarbitValueEncoding::Zero,
            1 => VarbitValueEncoding::Integer,
            2 => VarbitValueEncoding::Float,
            _ => {
                return Err(StorageError::corruption(
                    "invalid varbit value sub-encoding",
                ))
            }
        };
        let leading = data[4];
        let trailing = data[5];
        if leading != XOR_WINDOW_UNSET && u32::from(leading) + u32::from(trailing) > 63 {
            return Err(StorageError::corruption("invalid varbit XOR window"));
        }
        let len_bits = u32::from(u16::from_le_bytes([data[6], data[7]]));
        if len_bits > VARBIT_MAX_BITS {
            return Err(StorageError::corruption(
                "varbit bit length exceeds chunk capacity",
            ));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[8..16]);
        let base_time = i64::from_le_bytes(raw);
        raw.copy_from_slice(&data[16..24]);
        let base_value = f64::from_le_bytes(raw);
        raw.copy_from_slice(&data[24..32]);
        let last_time = i64::from_le_bytes(raw);
        raw.copy_from_slice(&data[32..40]);
        let last_time_delta = i64::from_le_bytes(raw);
        raw.copy_from_slice(&data[40..48]);
        let last_value = f64::from_le_bytes(raw);
        raw.copy_from_slice(&data[48..56]);
        let last_value_delta = i64::from_le_bytes(raw);
        let byte_len = len_bits.div_ceil(8) as usize;
        Ok(VarbitChunk {
            value_encoding,
            count,
            base_time,
            base_value,
            last_time,
            last_time_delta,
            last_value,
            last_value_delta,
            leading,
            trailing,
            bits: BitBuf {
                bytes: data[VARBIT_HEADER_LEN..VARBIT_HEADER_LEN + byte_len].to_vec(),
                len_bits,
            },
        })
    }
}

struct VarbitDecoder<'a> {
    chunk: &'a VarbitChunk,
    cursor: BitCursor<'a>,
    read: u16,
    t: Timestamp,
    time_delta: i64,
    value_bits: u64,
    value_delta: i64,
    leading: u8,
    trailing: u8,
}

impl<'a> VarbitDecoder<'a> {
    fn new(chunk: &'a VarbitChunk) -> Self {
        VarbitDecoder {
            chunk,
            cursor: BitCursor::new(&chunk.bits.bytes, chunk.bits.len_bits),
            read: 0,
            t: 0,
            time_delta: 0,
            value_bits: 0,
            value_delta: 0,
            leading: XOR_WINDOW_UNSET,
            trailing: 0,
        }
    }

    fn next(&mut self) -> Result<Option<SamplePair>, StorageError> {
        if self.read >= self.chunk.count {
            return Ok(None);
        }
        if self.read == 0 {
            self.read = 1;
            self.t = self.chunk.base_time;
            self.value_bits = self.chunk.base_value.to_bits();
            return Ok(Some(SamplePair {
                timestamp: self.t,
                value: self.chunk.base_value,
            }));
        }
        let dod = read_time_dod(&mut self.cursor)?;
        self.time_delta += dod;
        self.t += self.time_delta;
        let value = match self.chunk.value_encoding {
            VarbitValueEncoding::Zero => f64::from_bits(self.value_bits),
            VarbitValueEncoding::Integer => {
                let vdod = read_int_dod(&mut self.cursor)?;
                self.value_delta += vdod;
                let v = f64::from_bits(self.value_bits) + self.value_delta as f64;
                self.value_bits = v.to_bits();
                v
            }
            VarbitValueEncoding::Float => {
                let bits = read_xor(
                    &mut self.cursor,
                    self.value_bits,
                    &mut self.leading,
                    &mut self.trailing,
                )?;
                self.value_bits = bits;
                f64::from_bits(bits)
            }
        };
        self.read += 1;
        Ok(Some(SamplePair { timestamp: self.t, value }))
    }
}

/// Sequential iterator over a varbit chunk. The find operations scan
/// forward from the current position; use a fresh iterator to search from
/// the start.
pub(crate) struct VarbitIterator<'a> {
    decoder: VarbitDecoder<'a>,
    cur: SamplePair,
    peeked: Option<SamplePair>,
    started: bool,
    err: Option<StorageError>,
}

impl<'a> VarbitIterator<'a> {
    pub(crate) fn new(chunk: &'a VarbitChunk) -> Self {
        VarbitIterator {
            decoder: VarbitDecoder::new(chunk),
            cur: ZERO_SAMPLE_PAIR,
            peeked: None,
            started: false,
            err: None,
        }
    }

    fn advance(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        let next = match self.peeked.take() {
            Some(p) => Some(p),
            None => match self.decoder.next() {
                Ok(n) => n,
                Err(e) => {
                    self.err = Some(e);
                    return false;
                }
            },
        };
        match next {
            Some(p) => {
                self.cur = p;
                self.started = true;
                true
            }
            None => false,
        }
    }

    fn peek(&mut self) -> Option<SamplePair> {
        if self.err.is_some() {
            return None;
        }
        if self.peeked.is_none() {
            match self.decoder.next() {
                Ok(n) => self.peeked = n,
                Err(e) => {
                    self.err = Some(e);
                    return None;
                }
            }
        }
        self.peeked
    }

    pub(crate) fn scan(&mut self) -> bool {
        self.advance()
    }

    pub(crate) fn find_at_or_after(&mut self, t: Timestamp) -> bool {
        if !self.started && !self.advance() {
            return false;
        }
        loop {
            if self.cur.timestamp >= t {
                return true;
            }
            if !self.advance() {
                return false;
            }
        }
    }

    pub(crate) fn find_at_or_before(&mut self, t: Timestamp) -> bool {
        if !self.started && !self.advance() {
            return false;
        }
        if self.cur.timestamp > t {
            return false;
        }
        while let Some(next) = self.peek() {
            if next.timestamp <= t {
                self.advance();
            } else {
                break;
            }
        }
        self.err.is_none()
    }

    pub(crate) fn contains(&self, t: Timestamp) -> bool {
        self.decoder.chunk.count != 0
            && self.decoder.chunk.base_time <= t
            && t <= self.decoder.chunk.last_time
    }

    pub(crate) fn last_timestamp(&self) -> Timestamp {
        if self.decoder.chunk.count == 0 {
            EARLIEST
        } else {
            self.decoder.chunk.last_time
        }
    }

    pub(crate) fn value(&self) -> SamplePair {
        self.cur
    }

    pub(crate) fn err(&self) -> Option<StorageError> {
        self.err.clone()
    }
}
