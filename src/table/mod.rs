// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Sorted string tables
//!
//! A table is an immutable file of sorted entries:
//!
//! \[data block]* \[filter block]? \[metaindex block] \[index block] \[footer]
//!
//! Each block is followed by a 1-byte compression tag and a masked CRC32C
//! of the block contents plus tag. The index block maps a separator key
//! `>=` the last key of each data block to that block's handle.

pub mod block;
pub mod block_builder;
pub mod filter_block;
pub mod format;
pub mod reader;
pub mod two_level;
pub mod writer;

pub use reader::Table;
pub use writer::TableBuilder;

use crate::{bloom::FilterPolicy, comparator::Comparator, BlockCache, CompressionType};
use std::sync::Arc;

/// Table builder and reader settings
#[derive(Clone)]
pub struct TableOptions {
    /// Ordering of the keys stored in the table
    pub comparator: Arc<dyn Comparator>,

    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Approximate uncompressed size of data blocks
    pub block_size: usize,

    pub block_restart_interval: usize,

    pub compression: CompressionType,

    /// Verify every block read by this table
    pub paranoid_checks: bool,

    pub block_cache: Arc<BlockCache>,
}

impl TableOptions {
    /// Options with the given comparator and otherwise default settings
    #[cfg(test)]
    #[must_use]
    pub fn new(comparator: Arc<dyn Comparator>) -> Self {
        Self {
            comparator,
            filter_policy: None,
            block_size: 4_096,
            block_restart_interval: 16,
            compression: CompressionType::default(),
            paranoid_checks: false,
            block_cache: Arc::new(BlockCache::with_capacity_bytes(8 * 1_024 * 1_024)),
        }
    }
}
