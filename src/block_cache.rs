// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::table::block::Block;
use quick_cache::{sync::Cache, Weighter};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Fixed per-entry overhead charged on top of the block size
const BLOCK_OVERHEAD: u64 = 64;

// (Cache id, Table file number, Block offset)
type CacheKey = (u64, u64, u64);

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<CacheKey, Arc<Block>> for BlockWeighter {
    fn weight(&self, _: &CacheKey, block: &Arc<Block>) -> u64 {
        BLOCK_OVERHEAD + block.size() as u64
    }
}

/// Block cache, in which blocks are cached in-memory
/// after being retrieved from disk
///
/// This speeds up consecutive queries to nearby data, improving
/// read performance for hot data.
///
/// # Examples
///
/// Sharing block cache between multiple databases
///
/// ```
/// # use levelkv::{Db, Options, BlockCache};
/// # use std::sync::Arc;
/// #
/// // Provide 40 MB of cache capacity
/// let block_cache = Arc::new(BlockCache::with_capacity_bytes(40 * 1_000 * 1_000));
///
/// # let folder = tempfile::tempdir()?;
/// let db1 = Db::open(&folder, Options::default().create_if_missing(true).block_cache(block_cache.clone()))?;
/// # let folder = tempfile::tempdir()?;
/// let db2 = Db::open(&folder, Options::default().create_if_missing(true).block_cache(block_cache.clone()))?;
/// #
/// # Ok::<(), levelkv::Error>(())
/// ```
pub struct BlockCache {
    data: Cache<CacheKey, Arc<Block>, BlockWeighter>,
    capacity: u64,

    /// Partitions the key space between databases sharing this cache
    next_id: AtomicU64,
}

impl BlockCache {
    /// Creates a new block cache with roughly `bytes` bytes of capacity
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        // NOTE: Truncation is fine, it is only a sizing hint
        #[allow(clippy::cast_possible_truncation)]
        let estimated_items = ((bytes / 4_096) as usize).max(16);

        Self {
            data: Cache::with_weighter(estimated_items, bytes.max(1), BlockWeighter),
            capacity: bytes,
            next_id: AtomicU64::new(1),
        }
    }

    /// Hands out a new id, so every client of the cache gets its own key space.
    pub(crate) fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the cache capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the number of cached blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if there are no cached blocks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the summed weight of all cached blocks in bytes
    #[must_use]
    pub fn weight(&self) -> u64 {
        self.data.weight()
    }

    pub(crate) fn insert(&self, cache_id: u64, file_number: u64, offset: u64, block: Arc<Block>) {
        if self.capacity > 0 {
            self.data.insert((cache_id, file_number, offset), block);
        }
    }

    pub(crate) fn get(&self, cache_id: u64, file_number: u64, offset: u64) -> Option<Arc<Block>> {
        self.data.get(&(cache_id, file_number, offset))
    }

    pub(crate) fn remove(&self, cache_id: u64, file_number: u64, offset: u64) {
        self.data.remove(&(cache_id, file_number, offset));
    }

    /// Drops every cached block of a table.
    ///
    /// Visits the whole cache, so prefer [`BlockCache::remove`] when the
    /// block offsets are known.
    pub(crate) fn remove_table(&self, cache_id: u64, file_number: u64) {
        self.data
            .retain(|&(id, number, _), _| id != cache_id || number != file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn block(payload_len: usize) -> Arc<Block> {
        // Empty restart array
        let mut data = vec![0; payload_len];
        data.extend_from_slice(&0u32.to_le_bytes());
        Arc::new(Block::new(data).expect("should parse"))
    }

    #[test]
    fn block_cache_insert_get_remove() {
        let cache = BlockCache::with_capacity_bytes(1_024 * 1_024);

        cache.insert(1, 1, 0, block(100));
        cache.insert(1, 1, 200, block(100));
        cache.insert(1, 2, 0, block(100));

        assert_eq!(3, cache.len());
        assert!(cache.get(1, 1, 200).is_some());
        assert!(cache.get(1, 3, 0).is_none());
        assert_eq!(3 * (BLOCK_OVERHEAD + 104), cache.weight());

        cache.remove(1, 1, 200);
        assert!(cache.get(1, 1, 200).is_none());
        assert_eq!(2, cache.len());
    }

    #[test]
    fn block_cache_zero_capacity() {
        let cache = BlockCache::with_capacity_bytes(0);
        cache.insert(1, 1, 0, block(10));
        assert!(cache.is_empty());
    }

    #[test]
    fn block_cache_evicts_by_weight() {
        let cache = BlockCache::with_capacity_bytes(10 * 1_024);

        for offset in 0..100 {
            cache.insert(1, 1, offset * 1_024, block(1_000));
        }

        assert!(cache.weight() <= 10 * 1_024);
        assert!(cache.len() < 100);
    }

    #[test]
    fn block_cache_ids_are_disjoint() {
        let cache = BlockCache::with_capacity_bytes(1_024 * 1_024);

        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, b);

        cache.insert(a, 1, 0, block(100));
        assert!(cache.get(a, 1, 0).is_some());
        assert!(cache.get(b, 1, 0).is_none());
    }

    #[test]
    fn block_cache_remove_table() {
        let cache = BlockCache::with_capacity_bytes(1_024 * 1_024);

        for offset in 0..10 {
            cache.insert(1, 4, offset * 100, block(10));
            cache.insert(1, 5, offset * 100, block(10));
            cache.insert(2, 4, offset * 100, block(10));
        }

        cache.remove_table(1, 4);

        assert_eq!(20, cache.len());
        assert!(cache.get(1, 4, 0).is_none());
        assert!(cache.get(1, 5, 0).is_some());
        assert!(cache.get(2, 4, 0).is_some());
    }
}
