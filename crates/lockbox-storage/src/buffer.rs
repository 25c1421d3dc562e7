//! Growable in-memory byte buffer backing an open index segment.
//!
//! Invariant: `length <= capacity`, where `length` is the highest position
//! any write has reached. After a write `position <= length`; a seek may
//! park the cursor past `length` without allocating. Capacity doubles from
//! [`INITIAL_CAPACITY`] and never shrinks.

use lockbox_core::{LockboxError, LockboxResult};

pub const INITIAL_CAPACITY: usize = 4096;

/// Upper bound on a single segment's size (Vec cannot exceed `isize::MAX`).
pub const MAX_CAPACITY: usize = isize::MAX as usize;

#[derive(Debug, Default, Clone)]
pub struct GrowableBuffer {
    /// Zero-filled storage; `data.len()` is the capacity
    data: Vec<u8>,
    position: usize,
    length: usize,
}

impl GrowableBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes: `length` is their size, cursor at 0.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        Self {
            data: bytes,
            position: 0,
            length,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor. Positions past `length` are allowed; the gap reads
    /// as zeros once a later write extends the buffer over it.
    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Grow (by doubling) until `capacity >= min`.
    pub fn ensure_capacity(&mut self, min: usize) -> LockboxResult<()> {
        let current = self.data.len();
        if current >= min {
            return Ok(());
        }
        let mut capacity = current.max(INITIAL_CAPACITY);
        while capacity < min {
            capacity = capacity
                .checked_mul(2)
                .filter(|c| *c <= MAX_CAPACITY)
                .ok_or(LockboxError::SegmentTooLarge(capacity))?;
        }
        self.data
            .try_reserve_exact(capacity - current)
            .map_err(|_| LockboxError::SegmentTooLarge(capacity))?;
        self.data.resize(capacity, 0);
        Ok(())
    }

    /// Write `bytes` at the cursor and advance it.
    pub fn put(&mut self, bytes: &[u8]) -> LockboxResult<()> {
        let end = self
            .position
            .checked_add(bytes.len())
            .ok_or(LockboxError::SegmentTooLarge(self.position))?;
        self.ensure_capacity(end)?;
        self.data[self.position..end].copy_from_slice(bytes);
        self.position = end;
        self.length = self.length.max(end);
        Ok(())
    }

    pub fn put_byte(&mut self, byte: u8) -> LockboxResult<()> {
        self.put(&[byte])
    }

    /// Read up to `out.len()` bytes at the cursor and advance it.
    /// Returns 0 at or past `length`.
    pub fn get(&mut self, out: &mut [u8]) -> usize {
        let available = self.length.saturating_sub(self.position);
        let n = available.min(out.len());
        if n == 0 {
            return 0;
        }
        out[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        n
    }

    pub fn get_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        (self.get(&mut byte) == 1).then_some(byte[0])
    }

    /// The logical contents, `[0, length)`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.length]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}
