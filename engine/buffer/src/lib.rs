//! Segmented network send/receive buffers.
//!
//! A [`Buffer`] is an ordered list of pool-backed [`Chunk`]s carrying a
//! byte stream. Only the head chunk may have consumed bytes in front of
//! its pending data, and only the tail may have free space behind it, so
//! the pending stream is always the concatenation of each chunk's used
//! region in order.
//!
//! The design is tuned for small packets: the common path appends into the
//! current tail and drains the head with no allocation. Chunks past the
//! first exist to absorb bursts and oversized packets, at the cost of the
//! occasional copy when a consumer needs a contiguous view.

mod chunk;

pub use chunk::{chunk_pool, Chunk, DEFAULT_CHUNK_CAPACITY};

use std::collections::VecDeque;

/// Default soft cap on chunks per buffer.
pub const DEFAULT_CHUNK_MAX: usize = 8;

/// An ordered byte stream stored as a list of chunks.
pub struct Buffer {
    chunks: VecDeque<Box<Chunk>>,
    chunk_capacity: usize,
    chunk_max: usize,
    overflow: bool,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_CHUNK_CAPACITY, DEFAULT_CHUNK_MAX)
    }

    /// A buffer with explicit chunk capacity and soft chunk cap.
    ///
    /// Buffers with the default capacity draw chunks from the process
    /// pool; other capacities allocate directly.
    pub fn with_params(chunk_capacity: usize, chunk_max: usize) -> Self {
        assert!(chunk_capacity > 0, "chunk capacity must be non-zero");
        Self {
            chunks: VecDeque::new(),
            chunk_capacity,
            chunk_max,
            overflow: false,
        }
    }

    /// Adjust the soft cap. Takes effect on the next append.
    pub fn set_chunk_max(&mut self, chunk_max: usize) {
        self.chunk_max = chunk_max;
    }

    pub fn chunk_max(&self) -> usize {
        self.chunk_max
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Number of chunks currently on the list.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// True once the chunk count has exceeded the soft cap. The owning
    /// socket decides what to do about it; appends never fail.
    pub fn is_overflowed(&self) -> bool {
        self.overflow
    }

    pub fn clear_overflow(&mut self) {
        self.overflow = false;
    }

    /// Total pending bytes across all chunks. O(chunks).
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.used_size()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    /// Bytes of storage currently allocated to this buffer.
    pub fn allocated_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.capacity()).sum()
    }

    fn alloc_chunk(&self) -> Box<Chunk> {
        if self.chunk_capacity == DEFAULT_CHUNK_CAPACITY {
            chunk_pool().take()
        } else {
            Box::new(Chunk::with_capacity(self.chunk_capacity))
        }
    }

    fn release_chunk(chunk: Box<Chunk>) {
        // Only homogeneous chunks go back on the free list.
        if chunk.capacity() == DEFAULT_CHUNK_CAPACITY {
            chunk_pool().put(chunk);
        }
    }

    /// Ensure the tail has at least `len` contiguous free bytes (at least
    /// one byte when `len == 0`), allocating a new tail chunk if needed.
    ///
    /// `len` must not exceed the chunk capacity. When an explicit `len`
    /// forces a new tail, the old tail keeps its gap; the pending stream
    /// stays ordered, it is just not contiguous across the boundary.
    pub fn reserve(&mut self, len: usize) {
        debug_assert!(
            len <= self.chunk_capacity,
            "reserve({len}) exceeds chunk capacity ({})",
            self.chunk_capacity
        );

        let need = len.max(1);
        let tail_space = self.chunks.back().map(|c| c.space_size()).unwrap_or(0);
        if self.chunks.is_empty() || tail_space < need {
            let chunk = self.alloc_chunk();
            self.chunks.push_back(chunk);
            if self.chunks.len() > self.chunk_max {
                self.overflow = true;
            }
            // A drained head may linger so an empty buffer can be reused
            // without allocation; once a second chunk exists it is waste.
            if self.chunks.len() > 1 && self.chunks.front().is_some_and(|c| c.is_empty()) {
                let head = self.chunks.pop_front().unwrap();
                Self::release_chunk(head);
            }
        }
    }

    /// Append bytes, allocating chunks on demand.
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            self.reserve(0);
            let tail = self.chunks.back_mut().unwrap();
            let take = tail.space_size().min(data.len());
            tail.append(&data[..take]);
            data = &data[take..];
        }
    }

    /// Drop `len` bytes from the front of the stream.
    ///
    /// Drained head chunks are released to the pool; a lone drained chunk
    /// has its cursors reset instead so the buffer can refill it without
    /// allocating.
    pub fn consume(&mut self, mut len: usize) {
        debug_assert!(len <= self.len(), "consume past pending data");
        while len > 0 {
            let chunks_len = self.chunks.len();
            let Some(head) = self.chunks.front_mut() else {
                return;
            };
            let used = head.used_size();
            if used > len {
                head.advance(len);
                return;
            }
            len -= used;
            if chunks_len > 1 {
                let head = self.chunks.pop_front().unwrap();
                Self::release_chunk(head);
            } else {
                head.clear();
                return;
            }
        }
    }

    /// Drop whole chunks from the front until at most `max_chunks` remain.
    /// Returns the number of pending bytes discarded.
    pub fn trim_front_to(&mut self, max_chunks: usize) -> usize {
        let mut dropped = 0;
        while self.chunks.len() > max_chunks.max(1) {
            let head = self.chunks.pop_front().unwrap();
            dropped += head.used_size();
            Self::release_chunk(head);
        }
        dropped
    }

    /// Drop whole chunks from the back until at most `max_chunks` remain.
    /// Returns the number of pending bytes discarded.
    pub fn trim_back_to(&mut self, max_chunks: usize) -> usize {
        let mut dropped = 0;
        while self.chunks.len() > max_chunks.max(1) {
            let tail = self.chunks.pop_back().unwrap();
            dropped += tail.used_size();
            Self::release_chunk(tail);
        }
        dropped
    }

    /// Drop all pending data and all chunks but leave the buffer usable.
    pub fn clear(&mut self) {
        while let Some(chunk) = self.chunks.pop_front() {
            Self::release_chunk(chunk);
        }
        self.overflow = false;
    }

    /// The tail's free region, for a direct syscall read. Call
    /// [`reserve`](Self::reserve) first; report bytes actually written via
    /// [`commit`](Self::commit).
    pub fn space_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.chunks.is_empty(), "space_mut without reserve");
        self.chunks.back_mut().map(|c| c.space_mut()).unwrap_or(&mut [])
    }

    /// Record `n` bytes written into the region returned by `space_mut`.
    pub fn commit(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let tail = self.chunks.back_mut().expect("commit without reserve");
        tail.commit(n);
    }

    /// The head's pending region, for a direct syscall write.
    pub fn head_used(&self) -> &[u8] {
        self.chunks.front().map(|c| c.used()).unwrap_or(&[])
    }

    /// Whether at least `len` pending bytes exist across all chunks.
    /// O(chunks), with early exit.
    pub fn has_at_least(&self, len: usize) -> bool {
        let mut used = 0;
        for chunk in &self.chunks {
            used += chunk.used_size();
            if used >= len {
                return true;
            }
        }
        used >= len
    }

    /// A contiguous view of the first `len` pending bytes.
    ///
    /// When the head chunk already holds `len` bytes this is a direct
    /// slice; otherwise the bytes are gathered into `scratch`. Returns
    /// `None` if fewer than `len` bytes are pending.
    pub fn contiguous<'a>(&'a self, len: usize, scratch: &'a mut Vec<u8>) -> Option<&'a [u8]> {
        let head = self.chunks.front()?;
        if head.used_size() >= len {
            return Some(&head.used()[..len]);
        }
        if !self.has_at_least(len) {
            return None;
        }

        scratch.clear();
        for chunk in &self.chunks {
            let take = chunk.used_size().min(len - scratch.len());
            scratch.extend_from_slice(&chunk.used()[..take]);
            if scratch.len() == len {
                break;
            }
        }
        Some(&scratch[..])
    }

    /// A contiguous view of the whole pending stream.
    pub fn contiguous_all<'a>(&'a self, scratch: &'a mut Vec<u8>) -> &'a [u8] {
        if self.chunks.len() <= 1 {
            return self.head_used();
        }
        scratch.clear();
        for chunk in &self.chunks {
            scratch.extend_from_slice(chunk.used());
        }
        &scratch[..]
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(buf: &Buffer) -> Vec<u8> {
        let mut scratch = Vec::new();
        buf.contiguous_all(&mut scratch).to_vec()
    }

    /// The head is the only chunk allowed consumed bytes; the tail is the
    /// only chunk allowed free space behind it (absent explicit reserve
    /// gaps); no interior chunk is empty.
    fn assert_invariants(buf: &Buffer) {
        let n = buf.chunks.len();
        for (i, chunk) in buf.chunks.iter().enumerate() {
            if i > 0 {
                assert_eq!(chunk.consumed(), 0, "interior chunk has consumed bytes");
            }
            if i + 1 < n {
                assert!(chunk.is_full(), "interior chunk has free space");
                assert!(!chunk.is_empty(), "interior chunk is empty");
            }
        }
    }

    #[test]
    fn test_append_consume_single_chunk() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.head_used(), b"hello");

        buf.consume(2);
        assert_eq!(buf.head_used(), b"llo");

        buf.consume(3);
        assert!(buf.is_empty());
        // A lone drained chunk is kept with reset cursors.
        assert_eq!(buf.chunk_count(), 1);
        assert_invariants(&buf);
    }

    #[test]
    fn test_append_spans_chunks() {
        let mut buf = Buffer::with_params(4, 16);
        buf.append(b"abcdefghij");
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.chunk_count(), 3);
        assert_eq!(pending(&buf), b"abcdefghij");
        assert_invariants(&buf);
    }

    #[test]
    fn test_consume_releases_drained_heads() {
        let mut buf = Buffer::with_params(4, 16);
        buf.append(b"abcdefghij");

        buf.consume(6);
        assert_eq!(buf.chunk_count(), 2);
        assert_eq!(pending(&buf), b"ghij");
        assert_invariants(&buf);

        buf.consume(4);
        assert!(buf.is_empty());
        assert_eq!(buf.chunk_count(), 1);
    }

    #[test]
    fn test_consume_straddling_exact_boundary() {
        let mut buf = Buffer::with_params(4, 16);
        buf.append(b"abcdefgh");
        buf.consume(4);
        assert_eq!(pending(&buf), b"efgh");
        assert_eq!(buf.chunk_count(), 1);
        assert_invariants(&buf);
    }

    #[test]
    fn test_empty_ops_are_noops() {
        let mut buf = Buffer::new();
        buf.append(b"");
        assert_eq!(buf.chunk_count(), 0);
        buf.consume(0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reserve_zero_guarantees_space() {
        let mut buf = Buffer::with_params(4, 16);
        buf.append(b"abcd"); // tail now full
        buf.reserve(0);
        assert!(!buf.space_mut().is_empty());
        assert_eq!(buf.chunk_count(), 2);
    }

    #[test]
    fn test_drained_head_reused_without_allocation() {
        let mut buf = Buffer::with_params(4, 16);
        buf.append(b"abcd");
        buf.consume(4); // lone chunk kept, cursors reset
        assert_eq!(buf.chunk_count(), 1);

        buf.append(b"x");
        assert_eq!(buf.chunk_count(), 1);
        assert_eq!(pending(&buf), b"x");
    }

    #[test]
    fn test_space_commit_roundtrip() {
        let mut buf = Buffer::with_params(8, 16);
        buf.reserve(4);
        let space = buf.space_mut();
        space[..4].copy_from_slice(b"data");
        buf.commit(4);
        assert_eq!(buf.head_used(), b"data");
    }

    #[test]
    fn test_has_at_least() {
        let mut buf = Buffer::with_params(4, 16);
        buf.append(b"abcdef");
        assert!(buf.has_at_least(0));
        assert!(buf.has_at_least(6));
        assert!(!buf.has_at_least(7));
    }

    #[test]
    fn test_contiguous_direct_and_gathered() {
        let mut buf = Buffer::with_params(4, 16);
        buf.append(b"abcdef");

        let mut scratch = Vec::new();
        // Within the head chunk: no copy, straight slice.
        assert_eq!(buf.contiguous(3, &mut scratch), Some(&b"abc"[..]));
        assert!(scratch.is_empty());

        // Across chunks: gathered into scratch.
        assert_eq!(buf.contiguous(6, &mut scratch), Some(&b"abcdef"[..]));

        let mut scratch = Vec::new();
        assert_eq!(buf.contiguous(7, &mut scratch), None);
    }

    #[test]
    fn test_overflow_flag_set_but_append_succeeds() {
        let mut buf = Buffer::with_params(4, 2);
        buf.append(b"abcdefghijkl"); // 3 chunks > max of 2
        assert!(buf.is_overflowed());
        assert_eq!(pending(&buf), b"abcdefghijkl");

        buf.clear_overflow();
        assert!(!buf.is_overflowed());
    }

    #[test]
    fn test_trim_front_and_back() {
        let mut buf = Buffer::with_params(4, 2);
        buf.append(b"aaaabbbbcccc"); // 3 full chunks
        assert!(buf.is_overflowed());

        let dropped = buf.trim_front_to(2);
        assert_eq!(dropped, 4);
        assert_eq!(pending(&buf), b"bbbbcccc");

        buf.append(b"dddd");
        let dropped = buf.trim_back_to(2);
        assert_eq!(dropped, 4);
        assert_eq!(pending(&buf), b"bbbbcccc");

        // Trimming never removes the last chunk.
        assert_eq!(buf.trim_front_to(0), 4);
        assert_eq!(buf.chunk_count(), 1);
    }

    #[test]
    fn test_allocation_law() {
        // append(B) for |B| = n allocates no more than
        // ceil(n / chunk_capacity) + 1 chunks.
        for n in [1usize, 3, 4, 5, 8, 13, 64] {
            let mut buf = Buffer::with_params(4, usize::MAX);
            let data: Vec<u8> = (0..n as u8).collect();
            buf.append(&data);
            assert!(buf.chunk_count() <= n.div_ceil(4) + 1, "n={n}");

            buf.append(b"");
            buf.consume(n);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_interleaved_read_write() {
        let mut buf = Buffer::with_params(4, 64);
        let mut expect: VecDeque<u8> = VecDeque::new();
        let mut next = 0u8;

        for round in 0..50 {
            let wr = (round * 7) % 11;
            for _ in 0..wr {
                buf.append(&[next]);
                expect.push_back(next);
                next = next.wrapping_add(1);
            }
            let rd = ((round * 3) % 9).min(expect.len());
            if rd > 0 {
                let mut scratch = Vec::new();
                let view = buf.contiguous(rd, &mut scratch).unwrap().to_vec();
                for (i, b) in view.iter().enumerate() {
                    assert_eq!(*b, expect[i]);
                }
                buf.consume(rd);
                expect.drain(..rd);
            }
            assert_eq!(buf.len(), expect.len());
            assert_invariants(&buf);
        }
    }

    #[test]
    fn test_default_capacity_uses_pool() {
        let mut buf = Buffer::new();
        buf.append(b"x");
        buf.clear();
        // The pool saw the allocation and got the chunk back. Counters
        // are process-wide, so only direction is asserted here.
        assert!(chunk_pool().counters().allocated() >= 1);
        assert!(pool_registered());
    }

    fn pool_registered() -> bool {
        engine_pool::pool_stats().iter().any(|s| s.name == "chunk")
    }
}
