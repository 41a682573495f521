// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    file::{sst_table_file_name, table_file_name},
    iter::{BoxedIterator, EmptyIterator},
    table::{format::FileHandle, Table, TableOptions},
    ReadOptions,
};
use quick_cache::sync::Cache;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Number of file descriptors kept for purposes other than tables
const NON_TABLE_FILES: usize = 10;

/// Keeps a bounded number of opened tables, keyed by file number
///
/// Tables are opened lazily on first use and closed when evicted.
pub struct TableCache {
    folder: PathBuf,
    opts: TableOptions,
    cache: Cache<u64, Arc<Table>>,

    /// Key space of this database's tables in the shared block cache
    cache_id: u64,
}

impl TableCache {
    /// Creates a table cache for a database allowed to use `max_open_files`
    /// file descriptors.
    pub fn new(folder: &Path, opts: TableOptions, max_open_files: usize) -> Self {
        let capacity = max_open_files.saturating_sub(NON_TABLE_FILES).max(1);
        let cache_id = opts.block_cache.new_id();

        Self {
            folder: folder.to_path_buf(),
            opts,
            cache: Cache::new(capacity),
            cache_id,
        }
    }

    pub fn options(&self) -> &TableOptions {
        &self.opts
    }

    /// Returns the opened table, opening and caching it if needed.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> crate::Result<Arc<Table>> {
        if let Some(table) = self.cache.get(&file_number) {
            return Ok(table);
        }

        let path = table_file_name(&self.folder, file_number);

        let file = match FileHandle::open(&path) {
            Ok(file) => file,
            Err(e) => {
                // Fall back to the legacy file extension
                let legacy_path = sst_table_file_name(&self.folder, file_number);
                FileHandle::open(&legacy_path).map_err(|_| e)?
            }
        };

        log::trace!("Opening table {file_number} ({file_size} bytes)");

        // NOTE: Errors are not cached, so a table that is repaired or
        // appears later is picked up on the next access
        let table = Table::open(file, file_size, self.opts.clone(), self.cache_id, file_number)?;
        self.cache.insert(file_number, table.clone());

        Ok(table)
    }

    /// Returns an iterator over the given table.
    ///
    /// Open failures are reported through the iterator's status.
    pub fn iter(&self, opts: &ReadOptions, file_number: u64, file_size: u64) -> BoxedIterator {
        match self.find_table(file_number, file_size) {
            Ok(table) => table.iter(opts),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    /// Looks up `key` in the given table, see [`Table::internal_get`].
    pub fn get<F: FnMut(&[u8], &[u8])>(
        &self,
        opts: &ReadOptions,
        file_number: u64,
        file_size: u64,
        key: &[u8],
        handle_result: F,
    ) -> crate::Result<()> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(opts, key, handle_result)
    }

    /// Returns the approximate offset of `key` in the given table, or 0
    /// if the table cannot be opened.
    pub fn approximate_offset_of(&self, file_number: u64, file_size: u64, key: &[u8]) -> u64 {
        self.find_table(file_number, file_size)
            .map(|table| table.approximate_offset_of(key))
            .unwrap_or_default()
    }

    /// Closes the table and drops its cached blocks.
    pub fn evict(&self, file_number: u64) {
        if let Some((_, table)) = self.cache.remove(&file_number) {
            table.evict_cached_blocks();
        } else {
            // The handle was already closed, but blocks read through it
            // may still be cached
            self.opts
                .block_cache
                .remove_table(self.cache_id, file_number);
        }
    }

    /// Number of currently opened tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }
}
