// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Contains the levelled compaction planner
//!
//! A compaction merges a set of files of level L with the overlapping
//! files of level L+1 into new files of level L+1.

pub(crate) mod levelled;

use crate::{
    comparator::{Comparator, InternalKeyComparator},
    version::{edit::VersionEdit, meta::{total_file_size, FileMetaData}, Version, NUM_LEVELS},
    Options,
};
use std::{cmp::Ordering, sync::Arc};

/// Describes a compaction: its inputs and the edit that will install it
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    icmp: InternalKeyComparator,

    pub(crate) input_version: Option<Arc<Version>>,
    pub(crate) edit: VersionEdit,

    /// Each compaction reads inputs from "level" and "level+1"
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],

    /// Files in level+2 that overlap the compaction range, used to decide
    /// when to cut the output file
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,

    /// Some output key has been seen
    seen_key: bool,

    /// Bytes of overlap between the current output and grandparent files
    overlapped_bytes: u64,

    /// State for implementing `is_base_level_for_key`
    ///
    /// `level_ptrs` holds indices into `input_version.files`: our state is
    /// that we are positioned at one of the file ranges for each higher
    /// level than the ones involved in this compaction (i.e. for all L >=
    /// level + 2).
    level_ptrs: [usize; NUM_LEVELS],
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Compaction(L{}: {:?} + L{}: {:?})",
            self.level,
            self.inputs[0].iter().map(|f| f.number).collect::<Vec<_>>(),
            self.level + 1,
            self.inputs[1].iter().map(|f| f.number).collect::<Vec<_>>(),
        )
    }
}

impl Compaction {
    pub(crate) fn new(options: &Options, icmp: InternalKeyComparator, level: usize) -> Self {
        Self {
            level,
            max_output_file_size: options.max_file_size,
            max_grandparent_overlap: options.max_grandparent_overlap_bytes(),
            icmp,
            input_version: None,
            edit: VersionEdit::default(),
            inputs: Default::default(),
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    /// Level that is being compacted; inputs from "level" and "level+1"
    /// are merged to produce a set of "level+1" files.
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Returns the input files of "level" (0) or "level+1" (1).
    #[must_use]
    pub fn inputs(&self, which: usize) -> &[Arc<FileMetaData>] {
        match self.inputs.get(which) {
            Some(files) => files,
            None => &[],
        }
    }

    /// Returns the i-th input file of "level+which".
    #[must_use]
    pub fn input(&self, which: usize, i: usize) -> Option<&Arc<FileMetaData>> {
        self.inputs(which).get(i)
    }

    #[must_use]
    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs(which).len()
    }

    /// Maximum size of files to build during this compaction
    #[must_use]
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// Returns `true` if this compaction can be done by moving a single
    /// input file to the next level (no merging or splitting).
    #[must_use]
    pub fn is_trivial_move(&self) -> bool {
        // Avoid a move if there is lots of overlapping grandparent data.
        // Otherwise, the move could create a parent file that will require
        // a very expensive merge later on.
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Adds all inputs to this compaction as delete operations to the edit.
    pub fn add_input_deletions(&mut self) {
        for (which, files) in self.inputs.iter().enumerate() {
            for f in files {
                self.edit.remove_file(self.level + which, f.number);
            }
        }
    }

    /// Returns `true` if the information we have available guarantees that
    /// the compaction is producing data in "level+1" for which no data
    /// exists in levels greater than "level+1".
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        // Maybe use binary search to find right entry instead of linear search?
        let Some(version) = &self.input_version else {
            return true;
        };

        let ucmp = self.icmp.user_comparator();

        for level in (self.level + 2)..NUM_LEVELS {
            let files = &version.files[level];

            while let Some(f) = files.get(self.level_ptrs[level]) {
                if ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater {
                    // We've advanced far enough
                    if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less {
                        // Key falls in this file's range, so definitely not base level
                        return false;
                    }
                    break;
                }

                self.level_ptrs[level] += 1;
            }
        }

        true
    }

    /// Returns `true` if we should stop building the current output
    /// before processing `internal_key`.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        // Scan to find earliest grandparent file that contains key
        while let Some(f) = self.grandparents.get(self.grandparent_index) {
            if self.icmp.compare(internal_key, f.largest.encoded()) != Ordering::Greater {
                break;
            }

            if self.seen_key {
                self.overlapped_bytes += f.file_size;
            }

            self.grandparent_index += 1;
        }

        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            // Too much overlap for current output; start new output
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Releases the input version for the compaction, once the
    /// compaction is successful.
    pub fn release_inputs(&mut self) {
        self.input_version = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comparator::BytewiseComparator,
        value::{InternalKey, ValueType},
        version::tests::{file, test_context},
    };
    use test_log::test;

    fn compaction(level: usize) -> Compaction {
        Compaction::new(
            &Options::default(),
            InternalKeyComparator::new(Arc::new(BytewiseComparator)),
            level,
        )
    }

    #[test]
    fn compaction_trivial_move() {
        let mut c = compaction(1);
        c.inputs[0] = vec![file(1, "a", "b")];
        assert!(c.is_trivial_move());

        c.inputs[1] = vec![file(2, "a", "c")];
        assert!(!c.is_trivial_move());
    }

    #[test]
    fn compaction_input_deletions() {
        let mut c = compaction(2);
        c.inputs[0] = vec![file(1, "a", "b")];
        c.inputs[1] = vec![file(2, "a", "c"), file(3, "d", "e")];
        c.add_input_deletions();

        let deleted = c.edit.deleted_files.iter().copied().collect::<Vec<_>>();
        assert_eq!(vec![(2, 1), (3, 2), (3, 3)], deleted);
    }

    #[test]
    fn compaction_is_base_level_for_key() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let mut version = Version::new(test_context(folder.path()));
        version.files[3] = vec![file(1, "c", "e"), file(2, "k", "m")];

        let mut c = compaction(1);
        c.input_version = Some(Arc::new(version));

        // Keys must be asked in increasing order
        assert!(c.is_base_level_for_key(b"a"));
        assert!(!c.is_base_level_for_key(b"d"));
        assert!(c.is_base_level_for_key(b"f"));
        assert!(!c.is_base_level_for_key(b"k"));
        assert!(c.is_base_level_for_key(b"z"));

        Ok(())
    }

    #[test]
    fn compaction_should_stop_before() {
        let mut c = Compaction::new(
            &Options::default().max_file_size(1 << 20).grandparent_overlap_factor(1),
            InternalKeyComparator::new(Arc::new(BytewiseComparator)),
            1,
        );

        c.grandparents = (0..4u64)
            .map(|idx| {
                let key = format!("{idx}");
                Arc::new(FileMetaData::new(
                    idx + 1,
                    600 * 1_024,
                    InternalKey::new(format!("{key}a").as_bytes(), 1, ValueType::Value),
                    InternalKey::new(format!("{key}z").as_bytes(), 1, ValueType::Value),
                ))
            })
            .collect();

        let key = |s: &str| InternalKey::new(s.as_bytes(), 5, ValueType::Value);

        assert!(!c.should_stop_before(key("0b").encoded()));

        // Passing one grandparent file (600 KiB) is fine
        assert!(!c.should_stop_before(key("1b").encoded()));

        // Passing a second one exceeds 1 MiB
        assert!(c.should_stop_before(key("2b").encoded()));

        // Counter was reset
        assert!(!c.should_stop_before(key("2c").encoded()));
    }
}
