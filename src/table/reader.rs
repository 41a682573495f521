// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    block::Block,
    filter_block::FilterBlockReader,
    format::{read_block, BlockHandle, FileHandle, Footer, FOOTER_LEN},
    two_level::TwoLevelIterator,
    TableOptions,
};
use crate::{
    coding::Decode,
    comparator::BytewiseComparator,
    iter::{BoxedIterator, InternalIterator},
    ReadOptions,
};
use std::sync::Arc;

/// Immutable, opened table file
///
/// Safe to share between threads; blocks are read on demand and
/// cached in the shared block cache.
pub struct Table {
    file: FileHandle,
    opts: TableOptions,

    /// Block cache key prefix: (cache id, file number)
    cache_key: (u64, u64),

    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,

    /// Used as the offset estimate of keys past the last data block
    metaindex_handle: BlockHandle,
}

impl Table {
    /// Opens a table of `file_size` bytes.
    ///
    /// Only the footer, index block and filter block are read eagerly.
    /// Data blocks are cached under `cache_id`, which must be unique per
    /// database sharing the block cache.
    pub fn open(
        file: FileHandle,
        file_size: u64,
        opts: TableOptions,
        cache_id: u64,
        file_number: u64,
    ) -> crate::Result<Arc<Self>> {
        if file_size < FOOTER_LEN as u64 {
            return Err(crate::Error::corruption(
                "file is too short to be an sstable",
            ));
        }

        let footer = file.read_at(file_size - FOOTER_LEN as u64, FOOTER_LEN)?;
        let footer = Footer::decode_from(&mut &footer[..])?;

        let index_block = read_block(&file, &footer.index_handle, opts.paranoid_checks)?;
        let index_block = Arc::new(Block::new(index_block)?);

        let mut table = Self {
            file,
            opts,
            cache_key: (cache_id, file_number),
            index_block,
            filter: None,
            metaindex_handle: footer.metaindex_handle,
        };

        table.read_filter();

        Ok(Arc::new(table))
    }

    /// Loads the filter block, if the table has one for the configured policy.
    ///
    /// Filters are only an optimization, so errors are ignored.
    fn read_filter(&mut self) {
        let Some(policy) = self.opts.filter_policy.clone() else {
            return;
        };

        let Ok(contents) = read_block(
            &self.file,
            &self.metaindex_handle,
            self.opts.paranoid_checks,
        ) else {
            return;
        };

        let Ok(metaindex) = Block::new(contents) else {
            return;
        };

        let key = format!("filter.{}", policy.name());

        let mut iter = Arc::new(metaindex).iter(Arc::new(BytewiseComparator));
        iter.seek(key.as_bytes());

        if !iter.valid() || iter.key() != key.as_bytes() {
            return;
        }

        let Ok(handle) = BlockHandle::decode_from_slice(iter.value()) else {
            return;
        };

        if let Ok(data) = read_block(&self.file, &handle, self.opts.paranoid_checks) {
            self.filter = Some(FilterBlockReader::new(policy, data));
        }
    }

    /// Converts an index entry value into an iterator over the
    /// referenced data block, going through the block cache.
    fn block_reader(&self, opts: ReadOptions, index_value: &[u8]) -> crate::Result<BoxedIterator> {
        let handle = BlockHandle::decode_from_slice(index_value)?;
        let cache = &self.opts.block_cache;
        let (cache_id, file_number) = self.cache_key;

        let block = if let Some(block) = cache.get(cache_id, file_number, handle.offset) {
            block
        } else {
            let contents = read_block(&self.file, &handle, opts.verify_checksums)?;
            let block = Arc::new(Block::new(contents)?);

            if opts.fill_cache {
                cache.insert(cache_id, file_number, handle.offset, block.clone());
            }

            block
        };

        Ok(Box::new(block.iter(self.opts.comparator.clone())))
    }

    /// Returns an iterator over the table contents.
    pub fn iter(self: &Arc<Self>, opts: &ReadOptions) -> BoxedIterator {
        let opts = *opts;
        let table = self.clone();

        let index_iter = Box::new(self.index_block.iter(self.opts.comparator.clone()));

        Box::new(TwoLevelIterator::new(
            index_iter,
            Box::new(move |index_value: &[u8]| table.block_reader(opts, index_value)),
        ))
    }

    /// Seeks to `key` and calls `handle_result` with the entry found, if any.
    ///
    /// The found entry is the first one `>= key`, which may not match `key`.
    /// The call is skipped if the filter rules out `key`.
    pub fn internal_get<F: FnMut(&[u8], &[u8])>(
        &self,
        opts: &ReadOptions,
        key: &[u8],
        mut handle_result: F,
    ) -> crate::Result<()> {
        let mut index_iter = self.index_block.iter(self.opts.comparator.clone());
        index_iter.seek(key);

        if index_iter.valid() {
            let index_value = index_iter.value();

            let excluded = match (&self.filter, BlockHandle::decode_from_slice(index_value)) {
                (Some(filter), Ok(handle)) => !filter.key_may_match(handle.offset, key),
                _ => false,
            };

            if !excluded {
                let mut block_iter = self.block_reader(*opts, index_value)?;
                block_iter.seek(key);

                if block_iter.valid() {
                    handle_result(block_iter.key(), block_iter.value());
                }

                block_iter.status()?;
            }
        }

        index_iter.status()
    }

    /// Returns the approximate file offset at which data for `key` begins
    /// (or would begin, if the key is not present).
    #[must_use]
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.opts.comparator.clone());
        index_iter.seek(key);

        if index_iter.valid() {
            if let Ok(handle) = BlockHandle::decode_from_slice(index_iter.value()) {
                return handle.offset;
            }
        }

        // Key is past the last key in the file, or the index entry is
        // broken; the metaindex block sits right before the end
        self.metaindex_handle.offset
    }

    /// Drops all data blocks of this table from the block cache.
    pub fn evict_cached_blocks(&self) {
        let (cache_id, file_number) = self.cache_key;

        let mut index_iter = self.index_block.iter(self.opts.comparator.clone());
        index_iter.seek_to_first();

        while index_iter.valid() {
            if let Ok(handle) = BlockHandle::decode_from_slice(index_iter.value()) {
                self.opts.block_cache.remove(cache_id, file_number, handle.offset);
            }
            index_iter.next();
        }
    }
}
