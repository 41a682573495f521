// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::InternalKey;
use std::sync::atomic::{AtomicI64, Ordering};

/// Metadata of a table file, shared by all versions that contain it
pub struct FileMetaData {
    /// File number, which is also the file name
    pub number: u64,

    /// File size in bytes
    pub file_size: u64,

    /// Smallest internal key served by the table
    pub smallest: InternalKey,

    /// Largest internal key served by the table
    pub largest: InternalKey,

    /// Seeks allowed until a compaction is triggered for this file
    pub(crate) allowed_seeks: AtomicI64,
}

impl FileMetaData {
    /// Creates file metadata with the default seek budget.
    #[must_use]
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(1 << 30),
        }
    }

    /// Sets the seek budget of a file.
    ///
    /// We arrange to automatically compact this file after a certain
    /// number of seeks. One seek costs roughly as much as compacting
    /// `divisor` bytes, so the budget is proportional to the file size,
    /// with a lower bound of 100 so that tiny files are not compacted
    /// too eagerly.
    pub(crate) fn init_allowed_seeks(&self, divisor: u64) {
        let seeks = i64::try_from(self.file_size / divisor.max(1)).unwrap_or(i64::MAX);
        self.allowed_seeks.store(seeks.max(100), Ordering::Relaxed);
    }

    /// Charges one seek, returning `true` once the budget is exhausted.
    pub(crate) fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::AcqRel) <= 1
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        Self {
            number: self.number,
            file_size: self.file_size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.file_size == other.file_size
            && self.smallest == other.smallest
            && self.largest == other.largest
    }
}

impl Eq for FileMetaData {}

impl std::fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}[{:?} .. {:?}]",
            self.number, self.file_size, self.smallest, self.largest
        )
    }
}

/// Sum of the file sizes
pub fn total_file_size<F: std::ops::Deref<Target = FileMetaData>>(files: &[F]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}
