// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{find_file, meta::FileMetaData};
use crate::{
    coding::{decode_fixed64, put_fixed64},
    comparator::InternalKeyComparator,
    iter::{BoxedIterator, InternalIterator},
    table::two_level::TwoLevelIterator,
    table_cache::TableCache,
    ReadOptions,
};
use std::sync::Arc;

const VALUE_LEN: usize = 16;

/// Iterates the sorted, disjoint files of a level
///
/// The key of each entry is the largest key of the file, the value is
/// the file number followed by the file size (both fixed64).
pub struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,

    /// Position in `files`; `files.len()` if invalid
    index: usize,

    value: [u8; VALUE_LEN],
}

impl LevelFileNumIterator {
    pub fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();

        Self {
            icmp,
            files,
            index,
            value: [0; VALUE_LEN],
        }
    }

    fn set_index(&mut self, index: usize) {
        self.index = index.min(self.files.len());

        if let Some(f) = self.files.get(self.index) {
            let mut buf = Vec::with_capacity(VALUE_LEN);
            put_fixed64(&mut buf, f.number);
            put_fixed64(&mut buf, f.file_size);
            self.value.copy_from_slice(&buf);
        }
    }

    /// Parses an entry value back into (file number, file size).
    pub fn decode_value(value: &[u8]) -> crate::Result<(u64, u64)> {
        if value.len() != VALUE_LEN {
            return Err(crate::Error::corruption(
                "FileReader invoked with unexpected value",
            ));
        }

        let (number, size) = value.split_at(8);
        Ok((decode_fixed64(number), decode_fixed64(size)))
    }
}

impl InternalIterator for LevelFileNumIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.set_index(0);
    }

    fn seek_to_last(&mut self) {
        let index = self.files.len().checked_sub(1).unwrap_or(self.files.len());
        self.set_index(index);
    }

    fn seek(&mut self, target: &[u8]) {
        let index = find_file(&self.icmp, &self.files, target);
        self.set_index(index);
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.set_index(self.index + 1);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());

        // Marks as invalid when moving before the first file
        let index = self.index.checked_sub(1).unwrap_or(self.files.len());
        self.set_index(index);
    }

    fn key(&self) -> &[u8] {
        match self.files.get(self.index) {
            Some(f) => f.largest.encoded(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        if self.valid() {
            &self.value
        } else {
            &[]
        }
    }

    fn status(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// Returns an iterator that yields the entries of the sorted, disjoint
/// `files`, opening each table lazily.
pub fn concatenating_iterator(
    icmp: &InternalKeyComparator,
    table_cache: &Arc<TableCache>,
    files: Vec<Arc<FileMetaData>>,
    opts: &ReadOptions,
) -> BoxedIterator {
    let opts = *opts;
    let table_cache = table_cache.clone();

    Box::new(TwoLevelIterator::new(
        Box::new(LevelFileNumIterator::new(icmp.clone(), files)),
        Box::new(move |file_value: &[u8]| {
            let (number, file_size) = LevelFileNumIterator::decode_value(file_value)?;
            Ok(table_cache.iter(&opts, number, file_size))
        }),
    ))
}
