//! Bounded per-session output history used to backfill newly attached subscribers.

use std::collections::VecDeque;

use crate::config::BufferConfig;
use crate::event::Chunk;

/// FIFO ring of recent chunks, bounded by chunk count and by total bytes.
/// Memory only; dropped with the session.
#[derive(Debug)]
pub struct OutputRing {
    chunks: VecDeque<Chunk>,
    total_bytes: usize,
    max_chunks: usize,
    max_bytes: usize,
}

impl OutputRing {
    pub fn new(max_chunks: usize, max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_chunks: max_chunks.max(1),
            max_bytes,
        }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        Self::new(config.max_chunks, config.max_bytes)
    }

    pub fn append(&mut self, chunk: Chunk) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);

        while self.chunks.len() > self.max_chunks || self.total_bytes > self.max_bytes {
            match self.chunks.pop_front() {
                Some(removed) => {
                    self.total_bytes = self.total_bytes.saturating_sub(removed.len());
                }
                None => {
                    self.total_bytes = 0;
                    break;
                }
            }
        }
    }

    /// Buffered chunks in arrival order. `since` is the last seq the caller already
    /// has; only later chunks are returned. If eviction already dropped chunks after
    /// `since`, replay starts at the oldest one still buffered.
    pub fn replay(&self, since: Option<u64>) -> Vec<Chunk> {
        match since {
            None => self.chunks.iter().cloned().collect(),
            Some(since) => {
                let start = self.chunks.partition_point(|chunk| chunk.seq <= since);
                self.chunks.range(start..).cloned().collect()
            }
        }
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.chunks.front().map(|c| c.seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.chunks.back().map(|c| c.seq)
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(chunks: &[Chunk]) -> Vec<u64> {
        chunks.iter().map(|c| c.seq).collect()
    }

    #[test]
    fn evicts_oldest_by_count() {
        let mut ring = OutputRing::new(3, usize::MAX);
        for seq in 0..5 {
            ring.append(Chunk::new(seq, format!("chunk-{seq}")));
        }
        assert_eq!(seqs(&ring.replay(None)), vec![2, 3, 4]);
        assert_eq!(ring.first_seq(), Some(2));
        assert_eq!(ring.last_seq(), Some(4));
    }

    #[test]
    fn evicts_oldest_by_bytes() {
        let mut ring = OutputRing::new(100, 10);
        ring.append(Chunk::new(0, "aaaa"));
        ring.append(Chunk::new(1, "bbbb"));
        ring.append(Chunk::new(2, "cccc"));
        assert_eq!(seqs(&ring.replay(None)), vec![1, 2]);
        assert_eq!(ring.total_bytes(), 8);
    }

    #[test]
    fn oversized_chunk_leaves_ring_empty() {
        let mut ring = OutputRing::new(10, 4);
        ring.append(Chunk::new(0, "ok"));
        ring.append(Chunk::new(1, "far too large"));
        assert!(ring.is_empty());
        assert_eq!(ring.total_bytes(), 0);
    }

    #[test]
    fn replay_since_excludes_the_acknowledged_chunk() {
        let mut ring = OutputRing::new(10, usize::MAX);
        for seq in 0..6 {
            ring.append(Chunk::new(seq, "x"));
        }
        assert_eq!(seqs(&ring.replay(Some(3))), vec![4, 5]);
        assert_eq!(seqs(&ring.replay(Some(0))), vec![1, 2, 3, 4, 5]);
        assert!(ring.replay(Some(5)).is_empty());
        assert!(ring.replay(Some(9)).is_empty());
    }

    #[test]
    fn replay_since_before_evicted_range_starts_at_oldest() {
        let mut ring = OutputRing::new(3, usize::MAX);
        for seq in 0..6 {
            ring.append(Chunk::new(seq, "x"));
        }
        assert_eq!(ring.first_seq(), Some(3));
        assert_eq!(seqs(&ring.replay(Some(0))), vec![3, 4, 5]);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut ring = OutputRing::new(10, 100);
        ring.append(Chunk::new(0, ""));
        assert!(ring.is_empty());
    }
}
