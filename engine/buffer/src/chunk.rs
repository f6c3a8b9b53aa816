//! A single fixed-capacity segment of a [`Buffer`](crate::Buffer).
//!
//! ```text
//!    +----------------------------------------------------------+
//!    |   consumed    |      pending data      |      free       |
//!    +----------------------------------------------------------+
//!    0             begin                     end            capacity
//! ```
//!
//! `[0, begin)` has been consumed and is dead, `[begin, end)` is pending,
//! `[end, capacity)` is writable. The storage never reallocates, so slices
//! of the free region stay valid across cursor updates.

use engine_pool::{ObjectPool, Poolable};
use std::sync::OnceLock;

/// Default segment size. Game packets are small, so the common case is a
/// whole packet (or several) inside one chunk.
pub const DEFAULT_CHUNK_CAPACITY: usize = 8192;

/// How many spare chunks the process pool keeps around.
const CHUNK_RETAIN: usize = 64;

/// The process-wide pool that default-capacity chunks are drawn from.
pub fn chunk_pool() -> &'static ObjectPool<Chunk> {
    static POOL: OnceLock<ObjectPool<Chunk>> = OnceLock::new();
    POOL.get_or_init(|| ObjectPool::new("chunk", CHUNK_RETAIN))
}

pub struct Chunk {
    data: Box<[u8]>,
    begin: usize,
    end: usize,
}

impl Chunk {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            begin: 0,
            end: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes pending between the two cursors.
    #[inline]
    pub fn used_size(&self) -> usize {
        self.end - self.begin
    }

    /// Writable bytes past the end cursor.
    #[inline]
    pub fn space_size(&self) -> usize {
        self.data.len() - self.end
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.end == self.data.len()
    }

    /// The pending region.
    #[inline]
    pub fn used(&self) -> &[u8] {
        &self.data[self.begin..self.end]
    }

    /// The free region, for a direct syscall read.
    #[inline]
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Record `n` bytes written to the free region.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        self.end += n;
        debug_assert!(self.end <= self.data.len(), "chunk commit past capacity");
    }

    /// Drop `n` bytes from the front of the pending region.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.begin += n;
        debug_assert!(self.begin <= self.end, "chunk advance past pending data");
    }

    /// Copy `data` into the free region.
    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.space_size(), "chunk append overflow");
        self.data[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
    }

    /// Reset both cursors, making the whole chunk writable again.
    #[inline]
    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    /// Dead bytes before the begin cursor.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.begin
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHUNK_CAPACITY)
    }
}

impl Poolable for Chunk {
    fn reset(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_accounting() {
        let mut chunk = Chunk::with_capacity(16);
        assert_eq!(chunk.space_size(), 16);
        assert!(chunk.is_empty());

        chunk.append(b"hello");
        assert_eq!(chunk.used(), b"hello");
        assert_eq!(chunk.space_size(), 11);

        chunk.advance(2);
        assert_eq!(chunk.used(), b"llo");
        assert_eq!(chunk.consumed(), 2);

        chunk.advance(3);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_commit_after_direct_write() {
        let mut chunk = Chunk::with_capacity(16);
        chunk.space_mut()[..4].copy_from_slice(b"data");
        chunk.commit(4);
        assert_eq!(chunk.used(), b"data");
    }

    #[test]
    fn test_clear_restores_capacity() {
        let mut chunk = Chunk::with_capacity(8);
        chunk.append(b"12345678");
        assert!(chunk.is_full());
        chunk.clear();
        assert_eq!(chunk.space_size(), 8);
        assert!(chunk.is_empty());
    }
}
