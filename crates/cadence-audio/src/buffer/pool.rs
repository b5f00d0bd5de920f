//! Pool of reusable decoded-sample chunks.
//!
//! Streaming re-decodes one hardware buffer's worth of audio every refill, so
//! chunks are recycled here instead of being allocated and freed on the hot path.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicU64, Ordering};

use cadence_core::{Error, Result};
use parking_lot::Mutex;
use tracing::trace;

/// A fixed-capacity buffer of decoded samples plus the count of valid samples.
///
/// A chunk is owned by exactly one stream session at a time; it moves back into
/// the pool by value, so it cannot be reachable from two sessions at once.
#[derive(Debug, Default)]
pub struct DecodedChunk {
    samples: Box<[f32]>,
    len: usize,
}

impl DecodedChunk {
    /// Allocate a zeroed chunk able to hold `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: vec![0.0f32; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Number of samples the chunk can hold.
    pub const fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Number of valid samples.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The valid samples.
    pub fn as_slice(&self) -> &[f32] {
        &self.samples[..self.len]
    }

    /// Copy as many samples from `src` as fit, replacing the previous content.
    ///
    /// Returns the number of samples copied.
    pub fn fill_from(&mut self, src: &[f32]) -> usize {
        let count = src.len().min(self.capacity());
        self.samples[..count].copy_from_slice(&src[..count]);
        self.len = count;
        count
    }

    /// Forget the valid samples; capacity is kept.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Counters describing how the pool has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Chunks created because nothing suitable was pooled.
    pub allocated: u64,
    /// Rents served from the pool.
    pub reused: u64,
    /// Pooled chunks thrown away by `rent` for being too small.
    pub discarded_undersized: u64,
    /// Returned chunks dropped because the pool was full.
    pub dropped_at_capacity: u64,
    /// Chunks currently idle in the pool.
    pub pooled: usize,
}

/// Thread-safe, bounded free list of [`DecodedChunk`]s.
pub struct DecodedChunkPool {
    free: Mutex<Vec<DecodedChunk>>,
    max_pooled: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded_undersized: AtomicU64,
    dropped_at_capacity: AtomicU64,
}

impl DecodedChunkPool {
    /// Create an empty pool that keeps at most `max_pooled` idle chunks.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded_undersized: AtomicU64::new(0),
            dropped_at_capacity: AtomicU64::new(0),
        }
    }

    /// Take a chunk with capacity of at least `min_capacity` samples.
    ///
    /// Pooled chunks that are too small are discarded rather than put back. A new
    /// chunk is allocated when the pool runs dry.
    pub fn rent(&self, min_capacity: usize) -> DecodedChunk {
        {
            let mut free = self.free.lock();
            while let Some(mut chunk) = free.pop() {
                if chunk.capacity() >= min_capacity {
                    chunk.clear();
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    return chunk;
                }
                self.discarded_undersized.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "Discarding pooled chunk of {} samples (need {min_capacity})",
                    chunk.capacity()
                );
            }
        }

        self.allocated.fetch_add(1, Ordering::Relaxed);
        DecodedChunk::with_capacity(min_capacity)
    }

    /// Hand a chunk back to the pool.
    ///
    /// A chunk that owns no storage (for example one left behind by
    /// `std::mem::take`) is rejected with [`Error::InvalidArgument`] and the pool is
    /// left untouched. Once the pool holds `max_pooled` chunks further returns are
    /// simply dropped.
    pub fn recycle(&self, mut chunk: DecodedChunk) -> Result<()> {
        if chunk.capacity() == 0 {
            return Err(Error::InvalidArgument(
                "cannot recycle a chunk without storage".to_string(),
            ));
        }

        let mut free = self.free.lock();
        if free.len() >= self.max_pooled {
            self.dropped_at_capacity.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        chunk.clear();
        free.push(chunk);
        Ok(())
    }

    /// Number of idle chunks currently pooled.
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }

    /// Maximum number of idle chunks the pool keeps.
    pub const fn max_pooled(&self) -> usize {
        self.max_pooled
    }

    /// Snapshot of the usage counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded_undersized: self.discarded_undersized.load(Ordering::Relaxed),
            dropped_at_capacity: self.dropped_at_capacity.load(Ordering::Relaxed),
            pooled: self.pooled(),
        }
    }
}

impl Default for DecodedChunkPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rent_allocates_when_empty() {
        let pool = DecodedChunkPool::new(4);
        let chunk = pool.rent(128);
        assert!(chunk.capacity() >= 128);
        assert!(chunk.is_empty());
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_recycled_chunk_is_reused() {
        let pool = DecodedChunkPool::new(4);
        let mut chunk = pool.rent(256);
        chunk.fill_from(&[0.5; 100]);
        pool.recycle(chunk).unwrap();
        assert_eq!(pool.pooled(), 1);

        let chunk = pool.rent(200);
        assert_eq!(chunk.capacity(), 256);
        assert!(chunk.is_empty());
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_rent_discards_undersized_chunks() {
        let pool = DecodedChunkPool::new(4);
        pool.recycle(DecodedChunk::with_capacity(16)).unwrap();
        pool.recycle(DecodedChunk::with_capacity(32)).unwrap();

        let chunk = pool.rent(64);
        assert_eq!(chunk.capacity(), 64);

        let stats = pool.stats();
        assert_eq!(stats.discarded_undersized, 2);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.pooled, 0);
    }

    #[test]
    fn test_recycle_rejects_chunk_without_storage() {
        let pool = DecodedChunkPool::new(4);
        pool.recycle(DecodedChunk::with_capacity(8)).unwrap();

        let err = pool.recycle(DecodedChunk::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_recycle_drops_beyond_capacity() {
        let pool = DecodedChunkPool::new(2);
        for _ in 0..5 {
            pool.recycle(DecodedChunk::with_capacity(8)).unwrap();
        }
        assert_eq!(pool.pooled(), 2);
        assert_eq!(pool.stats().dropped_at_capacity, 3);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_fill_from_truncates_to_capacity() {
        let mut chunk = DecodedChunk::with_capacity(3);
        assert_eq!(chunk.fill_from(&[1.0, 2.0, 3.0, 4.0]), 3);
        assert_eq!(chunk.as_slice(), &[1.0, 2.0, 3.0]);
    }

    proptest! {
        #[test]
        fn prop_pool_never_exceeds_max(
            max in 1usize..16,
            ops in proptest::collection::vec((any::<bool>(), 1usize..512), 0..200),
        ) {
            let pool = DecodedChunkPool::new(max);
            let mut held = Vec::new();
            for (is_rent, size) in ops {
                if is_rent {
                    let chunk = pool.rent(size);
                    prop_assert!(chunk.capacity() >= size);
                    held.push(chunk);
                } else if let Some(chunk) = held.pop() {
                    pool.recycle(chunk).unwrap();
                } else {
                    pool.recycle(DecodedChunk::with_capacity(size)).unwrap();
                }
                prop_assert!(pool.pooled() <= max);
            }
        }
    }
}
