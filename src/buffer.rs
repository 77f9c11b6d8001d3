//! Growable byte buffer backing every connection.
//!
//! [`Buffer`] wraps a [`BytesMut`] and grows its capacity by a configurable
//! multiplicative factor. Capacity only shrinks on an explicit
//! [`Buffer::trim`] or [`Buffer::resize`], and `len() <= capacity()` holds
//! after every operation.

use bytes::{Buf, Bytes, BytesMut};

/// Growth factor used when none is configured.
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;

/// Contiguous byte store with amortised append, insert and removal.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: BytesMut,
    growth: f64,
}

impl Default for Buffer {
    fn default() -> Self { Self::new() }
}

impl Buffer {
    /// Create an empty buffer using [`DEFAULT_GROWTH_FACTOR`].
    #[must_use]
    pub fn new() -> Self { Self::with_growth(DEFAULT_GROWTH_FACTOR) }

    /// Create an empty buffer growing by `factor` when full.
    #[must_use]
    pub fn with_growth(factor: f64) -> Self {
        Self {
            data: BytesMut::new(),
            growth: factor.max(1.0),
        }
    }

    /// Create an empty buffer with at least `capacity` bytes reserved.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            growth: DEFAULT_GROWTH_FACTOR,
        }
    }

    /// Number of bytes stored.
    #[must_use]
    pub fn len(&self) -> usize { self.data.len() }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Bytes that can be stored without reallocating.
    #[must_use]
    pub fn capacity(&self) -> usize { self.data.capacity() }

    /// View of the stored bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] { &self.data }

    /// Mutable view of the stored bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] { &mut self.data }

    /// Direct access to the backing storage for `tokio_util` decoders.
    pub fn as_bytes_mut(&mut self) -> &mut BytesMut { &mut self.data }

    /// Append `src` to the end of the buffer, returning the number of bytes
    /// appended.
    pub fn append(&mut self, src: &[u8]) -> usize {
        self.grow_for(src.len());
        self.data.extend_from_slice(src);
        src.len()
    }

    /// Insert `src` at `offset`, shifting later bytes right.
    ///
    /// Returns the number of bytes inserted, which is zero when `offset` lies
    /// past the end of the stored data.
    pub fn insert(&mut self, offset: usize, src: &[u8]) -> usize {
        let len = self.data.len();
        if offset > len {
            return 0;
        }
        self.grow_for(src.len());
        self.data.resize(len + src.len(), 0);
        self.data.copy_within(offset..len, offset + src.len());
        self.data[offset..offset + src.len()].copy_from_slice(src);
        src.len()
    }

    /// Drop up to `n` bytes from the front of the buffer.
    pub fn remove(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Drop up to `n` bytes starting at `offset`, closing the gap.
    pub fn remove_range(&mut self, offset: usize, n: usize) {
        let len = self.data.len();
        if offset >= len {
            return;
        }
        let n = n.min(len - offset);
        self.data.copy_within(offset + n..len, offset);
        self.data.truncate(len - n);
    }

    /// Detach the first `n` bytes as an immutable [`Bytes`].
    pub fn split_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.data.len());
        self.data.split_to(n).freeze()
    }

    /// Remove all stored bytes, keeping the allocation.
    pub fn clear(&mut self) { self.data.clear(); }

    /// Change the capacity to `new_capacity`.
    ///
    /// Requests smaller than the current length are ignored.
    pub fn resize(&mut self, new_capacity: usize) {
        let len = self.data.len();
        if new_capacity < len || new_capacity == self.data.capacity() {
            return;
        }
        if new_capacity > self.data.capacity() {
            self.data.reserve(new_capacity - len);
        } else {
            let mut fresh = BytesMut::with_capacity(new_capacity);
            fresh.extend_from_slice(&self.data);
            self.data = fresh;
        }
    }

    /// Shrink the capacity to the stored length.
    pub fn trim(&mut self) {
        let len = self.data.len();
        self.resize(len);
    }

    fn grow_for(&mut self, extra: usize) {
        let len = self.data.len();
        let needed = len.saturating_add(extra);
        let cap = self.data.capacity();
        if needed <= cap {
            return;
        }
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss,
            reason = "Growth targets are bounded by the requested size."
        )]
        let scaled = (cap as f64 * self.growth) as usize;
        let target = needed.max(scaled);
        self.data.reserve(target - len);
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] { self.as_slice() }
}
