// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Versions describe the set of table files of each level
//!
//! A [`Version`] is immutable. Changes are described by a
//! [`VersionEdit`](edit::VersionEdit), which is appended to the manifest
//! and applied to the current version to produce the next one.
//!
//! Readers pin the version they started with through an `Arc`, so
//! files of a version stay on disk until the last reader is gone.

pub mod builder;
pub mod edit;
pub mod level_iter;
pub mod meta;
pub mod set;

use crate::{
    comparator::{Comparator, InternalKeyComparator},
    iter::BoxedIterator,
    table_cache::TableCache,
    value::{
        InternalKey, LookupKey, ParsedInternalKey, UserValue, ValueType, MAX_SEQUENCE_NUMBER,
        VALUE_TYPE_FOR_SEEK,
    },
    Options, ReadOptions,
};
use level_iter::concatenating_iterator;
use meta::{total_file_size, FileMetaData};
use std::{
    cmp::Ordering,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc, Mutex,
    },
};

/// Number of levels
pub const NUM_LEVELS: usize = 7;

/// Maximum level to which a new compacted memtable is pushed if it
/// does not create overlap
///
/// We try to push to level 2 to avoid the relatively expensive
/// level 0=>1 compactions and to avoid some expensive manifest file
/// operations. We do not push all the way to the largest level since
/// that can generate a lot of wasted disk space if the same key space
/// is being repeatedly overwritten.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Target total size of a level
///
/// Level 0 is treated specially, its score is based on the file count.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn max_bytes_for_level(level: usize) -> f64 {
    let mut result = 10.0 * 1_048_576.0;
    let mut level = level;

    while level > 1 {
        result *= 10.0;
        level -= 1;
    }

    result
}

/// Returns the index of the first file whose largest key is `>= key`,
/// or `files.len()` if there is none.
///
/// `files` must be sorted and disjoint.
pub(crate) fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    key: &[u8],
) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.encoded(), key) == Ordering::Less)
}

fn after_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    // None means user_key is before all keys
    user_key.is_some_and(|k| ucmp.compare(k, f.largest.user_key()) == Ordering::Greater)
}

fn before_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    // None means user_key is after all keys
    user_key.is_some_and(|k| ucmp.compare(k, f.smallest.user_key()) == Ordering::Less)
}

/// Returns `true` if some file in `files` overlaps the user key range
/// `[smallest, largest]`.
///
/// `None` bounds are unbounded. If `disjoint_sorted_files` is set, `files`
/// must be sorted and disjoint, which allows a binary search.
pub(crate) fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint_sorted_files: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = &**icmp.user_comparator();

    if !disjoint_sorted_files {
        // Need to check against all files
        return files.iter().any(|f| {
            !after_file(ucmp, smallest_user_key, f) && !before_file(ucmp, largest_user_key, f)
        });
    }

    // Binary search over file list
    let index = match smallest_user_key {
        Some(user_key) => {
            let small = InternalKey::new(user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small.encoded())
        }
        None => 0,
    };

    match files.get(index) {
        // Beginning of range is after all files, so no overlap
        None => false,
        Some(f) => !before_file(ucmp, largest_user_key, f),
    }
}

/// Shared state of all versions of a database
pub struct VersionContext {
    pub(crate) options: Arc<Options>,
    pub(crate) icmp: InternalKeyComparator,
    pub(crate) table_cache: Arc<TableCache>,

    /// Raised when a version is dropped, so its files may be deleted
    pub(crate) obsolete_files: AtomicBool,
}

impl VersionContext {
    pub fn new(options: Arc<Options>, table_cache: Arc<TableCache>) -> Self {
        Self {
            icmp: InternalKeyComparator::new(options.comparator.clone()),
            options,
            table_cache,
            obsolete_files: AtomicBool::new(false),
        }
    }
}

/// File that was probed by a point read without containing the result
#[derive(Default)]
pub struct GetStats {
    pub(crate) seek_file: Option<(usize, Arc<FileMetaData>)>,
}

enum SaverState {
    NotFound,
    Found(UserValue),
    Deleted,
    Corrupt,
}

/// Immutable set of table files per level
pub struct Version {
    ctx: Arc<VersionContext>,

    /// List of files per level, sorted by smallest key
    ///
    /// Files of levels >= 1 are disjoint.
    pub(crate) files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],

    /// Level that should be compacted next and its compaction score
    ///
    /// A score < 1 means compaction is not strictly needed.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,

    /// Next file to compact based on seek stats
    file_to_compact: Mutex<Option<(usize, Arc<FileMetaData>)>>,
}

impl Drop for Version {
    fn drop(&mut self) {
        self.ctx.obsolete_files.store(true, AtomicOrdering::Release);
    }
}

impl Version {
    /// Creates an empty version.
    pub fn new(ctx: Arc<VersionContext>) -> Self {
        Self {
            ctx,
            files: Default::default(),
            compaction_score: -1.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
        }
    }

    /// Precomputes the best level for the next compaction.
    pub(crate) fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = -1.0;

        for level in 0..NUM_LEVELS - 1 {
            #[allow(clippy::cast_precision_loss)]
            let score = if level == 0 {
                // We treat level-0 specially by bounding the number of files
                // instead of number of bytes, for two reasons:
                //
                // (1) With larger write-buffer sizes, it is nice not to do too
                // many level-0 compactions.
                //
                // (2) The files in level-0 are merged on every read and
                // therefore we wish to avoid too many files when the individual
                // file size is small.
                self.files[level].len() as f64
                    / self.ctx.options.level0_compaction_trigger as f64
            } else {
                total_file_size(&self.files[level]) as f64 / max_bytes_for_level(level)
            };

            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }

        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Seek-triggered compaction candidate, if any
    pub fn file_to_compact(&self) -> Option<(usize, Arc<FileMetaData>)> {
        self.file_to_compact.lock().expect("lock is poisoned").clone()
    }

    /// Number of files in a level
    #[must_use]
    pub fn num_level_files(&self, level: usize) -> usize {
        self.files.get(level).map_or(0, Vec::len)
    }

    /// Total file size of a level
    #[must_use]
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files
            .get(level)
            .map_or(0, |files| total_file_size(files))
    }

    /// Calls `func` for every file that may contain `user_key`, newest
    /// first, until it returns `false`.
    fn for_each_overlapping<F: FnMut(usize, &Arc<FileMetaData>) -> bool>(
        &self,
        user_key: &[u8],
        internal_key: &[u8],
        mut func: F,
    ) {
        let ucmp = self.ctx.icmp.user_comparator();

        // Search level-0 in order from newest to oldest
        let mut level0 = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
            })
            .collect::<Vec<_>>();

        level0.sort_by(|a, b| b.number.cmp(&a.number));

        for f in level0 {
            if !func(0, f) {
                return;
            }
        }

        // Search other levels
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];

            let index = find_file(&self.ctx.icmp, files, internal_key);

            if let Some(f) = files.get(index) {
                if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && !func(level, f)
                {
                    return;
                }
            }
        }
    }

    /// Looks up the value of `key` in the tables of this version.
    ///
    /// Fills `stats` with the file that should be charged a seek, if
    /// more than one file had to be read.
    pub fn get(
        &self,
        opts: &ReadOptions,
        key: &LookupKey,
        stats: &mut GetStats,
    ) -> crate::Result<Option<UserValue>> {
        let user_key = key.user_key();
        let internal_key = key.internal_key();
        let ucmp = self.ctx.icmp.user_comparator().clone();
        let table_cache = &self.ctx.table_cache;

        stats.seek_file = None;

        let mut last_file_read: Option<(usize, Arc<FileMetaData>)> = None;
        let mut state = SaverState::NotFound;
        let mut error = None;

        self.for_each_overlapping(user_key, internal_key, |level, f| {
            if stats.seek_file.is_none() {
                // We have had more than one seek for this read, charge the first file
                if let Some(last) = last_file_read.take() {
                    stats.seek_file = Some(last);
                }
            }
            last_file_read = Some((level, f.clone()));

            let result = table_cache.get(
                opts,
                f.number,
                f.file_size,
                internal_key,
                |found_key, found_value| match ParsedInternalKey::parse(found_key) {
                    None => state = SaverState::Corrupt,
                    Some(parsed) => {
                        if ucmp.compare(parsed.user_key, user_key) == Ordering::Equal {
                            state = match parsed.value_type {
                                ValueType::Value => SaverState::Found(found_value.into()),
                                ValueType::Deletion => SaverState::Deleted,
                            };
                        }
                    }
                },
            );

            if let Err(e) = result {
                error = Some(e);
                return false;
            }

            // Keep searching in other files as long as nothing was found
            matches!(state, SaverState::NotFound)
        });

        if let Some(e) = error {
            return Err(e);
        }

        match state {
            SaverState::Found(value) => Ok(Some(value)),
            SaverState::Deleted | SaverState::NotFound => Ok(None),
            SaverState::Corrupt => Err(crate::Error::corruption(format!(
                "corrupted key for {:?}",
                String::from_utf8_lossy(user_key)
            ))),
        }
    }

    /// Charges a seek to the file recorded in `stats`.
    ///
    /// Returns `true` if a new compaction may need to be triggered.
    pub fn update_stats(&self, stats: GetStats) -> bool {
        let Some((level, f)) = stats.seek_file else {
            return false;
        };

        // The last level has no level to compact into
        if level + 1 >= NUM_LEVELS || !f.charge_seek() {
            return false;
        }

        let mut lock = self.file_to_compact.lock().expect("lock is poisoned");

        if lock.is_none() {
            log::debug!("Table {} in L{level} ran out of seeks", f.number);
            *lock = Some((level, f));
            return true;
        }

        false
    }

    /// Records a sample of bytes read at the specified internal key.
    ///
    /// Samples are taken approximately once every `READ_BYTES_PERIOD`
    /// bytes. Returns `true` if a new compaction may need to be triggered.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let Some(parsed) = ParsedInternalKey::parse(internal_key) else {
            return false;
        };

        let mut stats = GetStats::default();
        let mut matches = 0;

        self.for_each_overlapping(parsed.user_key, internal_key, |level, f| {
            matches += 1;

            if matches == 1 {
                // Remember first match
                stats.seek_file = Some((level, f.clone()));
            }

            // We can stop iterating once we have a second match
            matches < 2
        });

        // Must have at least two matches since we want to merge across
        // files. But what if we have a single file that contains many
        // overwrites and deletions? Should we have another mechanism for
        // finding such files?
        if matches >= 2 {
            return self.update_stats(stats);
        }

        false
    }

    /// Returns `true` if some file in `level` overlaps the user key range.
    #[must_use]
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.ctx.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Returns the level at which a new table holding the given user key
    /// range should be placed.
    #[must_use]
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;

        if self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            return level;
        }

        // Push to next level if there is no overlap in next level,
        // and the bytes overlapping in the level after that are limited
        let start = InternalKey::new(smallest_user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let limit = InternalKey::new(largest_user_key, 0, ValueType::Deletion);

        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key)) {
                break;
            }

            if level + 2 < NUM_LEVELS {
                // Check that file does not overlap too many grandparent bytes
                let overlaps = self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));

                if total_file_size(&overlaps) > self.ctx.options.max_grandparent_overlap_bytes() {
                    break;
                }
            }

            level += 1;
        }

        level
    }

    /// Returns all files in `level` that overlap `[begin, end]`.
    ///
    /// `None` bounds are unbounded. In level-0 the range is widened to the
    /// range of every overlapping file, because level-0 files may overlap
    /// each other.
    #[must_use]
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.ctx.icmp.user_comparator();
        let files = &self.files[level];

        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs = Vec::new();
        let mut index = 0;

        while let Some(f) = files.get(index) {
            index += 1;

            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();

            if user_begin
                .as_deref()
                .is_some_and(|b| ucmp.compare(file_limit, b) == Ordering::Less)
            {
                // "f" is completely before specified range; skip it
                continue;
            }

            if user_end
                .as_deref()
                .is_some_and(|e| ucmp.compare(file_start, e) == Ordering::Greater)
            {
                // "f" is completely after specified range; skip it
                continue;
            }

            inputs.push(f.clone());

            if level == 0 {
                // Level-0 files may overlap each other. So check if the newly
                // added file has expanded the range. If so, restart search.
                if user_begin
                    .as_deref()
                    .is_some_and(|b| ucmp.compare(file_start, b) == Ordering::Less)
                {
                    user_begin = Some(file_start.to_vec());
                    inputs.clear();
                    index = 0;
                } else if user_end
                    .as_deref()
                    .is_some_and(|e| ucmp.compare(file_limit, e) == Ordering::Greater)
                {
                    user_end = Some(file_limit.to_vec());
                    inputs.clear();
                    index = 0;
                }
            }
        }

        inputs
    }

    /// Returns the approximate offset of `key` within the whole database,
    /// counting the bytes of all files that come before it.
    #[must_use]
    pub fn approximate_offset_of(&self, key: &InternalKey) -> u64 {
        let icmp = &self.ctx.icmp;
        let mut result = 0;

        for (level, files) in self.files.iter().enumerate() {
            for f in files {
                if icmp.compare(f.largest.encoded(), key.encoded()) != Ordering::Greater {
                    // Entire file is before "key", so just add the file size
                    result += f.file_size;
                } else if icmp.compare(f.smallest.encoded(), key.encoded()) == Ordering::Greater {
                    // Entire file is after "key", so ignore
                    if level > 0 {
                        // Files other than level 0 are sorted by smallest key,
                        // so no further files in this level will contain data
                        // for "key"
                        break;
                    }
                } else {
                    // "key" falls in the range for this table. Add the
                    // approximate offset of "key" within the table.
                    result += self.ctx.table_cache.approximate_offset_of(
                        f.number,
                        f.file_size,
                        key.encoded(),
                    );
                }
            }
        }

        result
    }

    /// Appends iterators that together yield the contents of this version.
    pub fn add_iterators(&self, opts: &ReadOptions, iters: &mut Vec<BoxedIterator>) {
        // Merge all level zero files together since they may overlap
        for f in &self.files[0] {
            iters.push(self.ctx.table_cache.iter(opts, f.number, f.file_size));
        }

        // For levels > 0, we can use a concatenating iterator that sequentially
        // walks through the non-overlapping files in the level, opening them
        // lazily.
        for files in self.files.iter().skip(1) {
            if !files.is_empty() {
                iters.push(concatenating_iterator(
                    &self.ctx.icmp,
                    &self.ctx.table_cache,
                    files.clone(),
                    opts,
                ));
            }
        }
    }

    /// Returns a human-readable listing of all files.
    #[must_use]
    pub fn debug_string(&self) -> String {
        use std::fmt::Write;

        let mut s = String::new();

        for (level, files) in self.files.iter().enumerate() {
            // E.g.,
            //   --- level 1 ---
            //   17:123['a' @ 1 : 1 .. 'd' @ 3 : 1]
            let _ = writeln!(s, "--- level {level} ---");

            for f in files {
                let _ = writeln!(s, " {f:?}");
            }
        }

        s
    }
}
