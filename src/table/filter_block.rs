// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bloom::FilterPolicy,
    coding::{decode_fixed32, put_fixed32},
};
use std::sync::Arc;

/// Generate a new filter every 2 KiB of data block offsets
pub const FILTER_BASE_LG: u8 = 11;

const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Builds the single filter block of a table
///
/// The sequence of calls must match the regexp
/// `(start_block add_key*)* finish`.
///
/// # Disk representation
///
/// \[filter 0] ... \[filter N-1] \[offset of filter i; u32 LE each]
/// \[offset of the offset array; u32 LE] \[base lg; 1 byte]
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,

    /// Flattened key contents
    keys: Vec<u8>,

    /// Starting index in `keys` of each key
    start: Vec<usize>,

    /// Filter data computed so far
    result: Vec<u8>,

    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            start: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);

        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        // Append array of per-filter offsets
        // NOTE: Truncation is okay, filter blocks are far smaller than 4 GiB
        #[allow(clippy::cast_possible_truncation)]
        let array_offset = self.result.len() as u32;

        for offset in &self.filter_offsets {
            put_fixed32(&mut self.result, *offset);
        }

        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG);

        &self.result
    }

    fn generate_filter(&mut self) {
        // NOTE: Truncation is okay, filter blocks are far smaller than 4 GiB
        #[allow(clippy::cast_possible_truncation)]
        self.filter_offsets.push(self.result.len() as u32);

        if self.start.is_empty() {
            // Fast path if there are no keys for this filter
            return;
        }

        // Simplify length computation
        self.start.push(self.keys.len());

        let keys = self
            .start
            .windows(2)
            .filter_map(|w| match w {
                [lo, hi] => self.keys.get(*lo..*hi),
                _ => None,
            })
            .collect::<Vec<_>>();

        self.policy.create_filter(&keys, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

/// Probes the filter block of a table
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,

    /// Offset of the beginning of the offset array
    offset: usize,

    /// Number of entries in the offset array
    num: usize,

    base_lg: u8,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> Self {
        let mut reader = Self {
            policy,
            data: Vec::new(),
            offset: 0,
            num: 0,
            base_lg: 0,
        };

        let n = data.len();

        // 1 byte for base_lg and 4 for start of offset array
        if n < 5 {
            return reader;
        }

        let Some(&base_lg) = data.last() else {
            return reader;
        };

        let last_word = decode_fixed32(data.get(n - 5..).unwrap_or_default()) as usize;
        if last_word > n - 5 {
            return reader;
        }

        reader.base_lg = base_lg;
        reader.offset = last_word;
        reader.num = (n - 5 - last_word) / 4;
        reader.data = data;
        reader
    }

    /// Returns `false` if `key` is definitely not in the data block at `block_offset`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;

        if index < self.num {
            let pos = self.offset + index * 4;

            let start = self.data.get(pos..).map(decode_fixed32);
            let limit = self.data.get(pos + 4..).map(decode_fixed32);

            let (Some(start), Some(limit)) = (start, limit) else {
                return true;
            };
            let (start, limit) = (start as usize, limit as usize);

            if start <= limit && limit <= self.offset {
                let filter = self.data.get(start..limit).unwrap_or_default();
                return self.policy.key_may_match(key, filter);
            } else if start == limit {
                // Empty filters do not match any keys
                return false;
            }
        }

        // Errors are treated as potential matches
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    /// For testing: emit an array with one hash value per key
    struct TestHashFilter;

    impl FilterPolicy for TestHashFilter {
        fn name(&self) -> &str {
            "TestHashFilter"
        }

        fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
            for key in keys {
                // NOTE: Truncation is okay and actually needed
                #[allow(clippy::cast_possible_truncation)]
                put_fixed32(dst, xxhash_rust::xxh3::xxh3_64(key) as u32);
            }
        }

        fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
            #[allow(clippy::cast_possible_truncation)]
            let h = xxhash_rust::xxh3::xxh3_64(key) as u32;
            filter.chunks_exact(4).any(|chunk| decode_fixed32(chunk) == h)
        }
    }

    #[test]
    fn filter_block_empty_builder() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
        let block = builder.finish().to_vec();
        assert_eq!(vec![0, 0, 0, 0, FILTER_BASE_LG], block);

        let reader = FilterBlockReader::new(Arc::new(TestHashFilter), block);
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100_000, b"foo"));
    }

    #[test]
    fn filter_block_single_chunk() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");
        let block = builder.finish().to_vec();

        let reader = FilterBlockReader::new(Arc::new(TestHashFilter), block);
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(reader.key_may_match(100, b"hello"));
        assert!(reader.key_may_match(100, b"foo"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn filter_block_multi_chunk() {
        let mut builder = FilterBlockBuilder::new(Arc::new(TestHashFilter));

        // First filter
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2_000);
        builder.add_key(b"bar");

        // Second filter
        builder.start_block(3_100);
        builder.add_key(b"box");

        // Third filter is empty

        // Last filter
        builder.start_block(9_000);
        builder.add_key(b"box");
        builder.add_key(b"hello");

        let block = builder.finish().to_vec();
        let reader = FilterBlockReader::new(Arc::new(TestHashFilter), block);

        // Check first filter
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2_000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));
        assert!(!reader.key_may_match(0, b"hello"));

        // Check second filter
        assert!(reader.key_may_match(3_100, b"box"));
        assert!(!reader.key_may_match(3_100, b"foo"));
        assert!(!reader.key_may_match(3_100, b"bar"));
        assert!(!reader.key_may_match(3_100, b"hello"));

        // Check third filter (empty)
        assert!(!reader.key_may_match(4_100, b"foo"));
        assert!(!reader.key_may_match(4_100, b"bar"));
        assert!(!reader.key_may_match(4_100, b"box"));
        assert!(!reader.key_may_match(4_100, b"hello"));

        // Check last filter
        assert!(reader.key_may_match(9_000, b"box"));
        assert!(reader.key_may_match(9_000, b"hello"));
        assert!(!reader.key_may_match(9_000, b"foo"));
        assert!(!reader.key_may_match(9_000, b"bar"));
    }
}
