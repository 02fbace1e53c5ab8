//! Per-write scoped arena for ciphertext.
//!
//! All ciphertext chunks a single `Socket::write` call produces are
//! allocated here and released together once the scatter-gather write
//! completes. Backed by one growable `Vec<u8>`; allocations are returned as
//! `(offset, len)` ranges rather than raw pointers, so growth (which can
//! move the buffer) never invalidates a range already handed out — only
//! `clear()` does, and callers only resolve ranges back to slices while the
//! pool is still live.

#[derive(Debug, Default)]
pub struct MemoryPool {
    buf: Vec<u8>,
}

/// A range into a `MemoryPool`'s backing buffer, valid until the pool is
/// next `clear()`-ed.
pub type PoolRange = (usize, usize);

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `data` into the arena and returns a stable range for it.
    pub fn alloc(&mut self, data: &[u8]) -> PoolRange {
        let start = self.buf.len();
        self.buf.extend_from_slice(data);
        (start, data.len())
    }

    pub fn slice(&self, range: PoolRange) -> &[u8] {
        &self.buf[range.0..range.0 + range.1]
    }

    /// Releases everything allocated so far; the pool is reusable.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
