// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Compaction;
use crate::{
    comparator::{Comparator, InternalKeyComparator},
    value::InternalKey,
    version::{
        meta::{total_file_size, FileMetaData},
        set::VersionSet,
        NUM_LEVELS,
    },
};
use std::{cmp::Ordering, sync::Arc};

/// Returns the smallest and largest key of all `files`.
fn get_range<'a>(
    icmp: &InternalKeyComparator,
    files: impl IntoIterator<Item = &'a Arc<FileMetaData>>,
) -> (InternalKey, InternalKey) {
    let mut files = files.into_iter();

    let Some(first) = files.next() else {
        return (InternalKey::default(), InternalKey::default());
    };

    let mut smallest = &first.smallest;
    let mut largest = &first.largest;

    for f in files {
        if icmp.compare(f.smallest.encoded(), smallest.encoded()) == Ordering::Less {
            smallest = &f.smallest;
        }
        if icmp.compare(f.largest.encoded(), largest.encoded()) == Ordering::Greater {
            largest = &f.largest;
        }
    }

    (smallest.clone(), largest.clone())
}

/// Finds the largest key in a vector of files.
fn find_largest_key(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
) -> Option<InternalKey> {
    files
        .iter()
        .map(|f| &f.largest)
        .max_by(|a, b| icmp.compare(a.encoded(), b.encoded()))
        .cloned()
}

/// Finds the file in `level_files` with the smallest `smallest` key that
/// is greater than `largest_key` while sharing its user key.
fn find_smallest_boundary_file(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    largest_key: &InternalKey,
) -> Option<Arc<FileMetaData>> {
    let ucmp = icmp.user_comparator();
    let mut result: Option<&Arc<FileMetaData>> = None;

    for f in level_files {
        if icmp.compare(f.smallest.encoded(), largest_key.encoded()) == Ordering::Greater
            && ucmp.compare(f.smallest.user_key(), largest_key.user_key()) == Ordering::Equal
            && result.is_none_or(|r| {
                icmp.compare(f.smallest.encoded(), r.smallest.encoded()) == Ordering::Less
            })
        {
            result = Some(f);
        }
    }

    result.cloned()
}

/// Extracts the largest file b1 from `compaction_files` and then searches
/// for a b2 in `level_files` for which `user_key(u1) = user_key(l2)`. If
/// it finds such a file b2 (known as a boundary file) it adds it to
/// `compaction_files` and then searches again using this new upper bound.
///
/// If there are two blocks, b1=(l1, u1) and b2=(l2, u2) and
/// `user_key(u1) = user_key(l2)`, and if we compact b1 but not b2 then a
/// subsequent get operation will yield an incorrect result because it will
/// return the record from b2 in level i rather than from b1 because it
/// searches level by level for records matching the supplied user key.
fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    compaction_files: &mut Vec<Arc<FileMetaData>>,
) {
    let Some(mut largest_key) = find_largest_key(icmp, compaction_files) else {
        return;
    };

    while let Some(boundary) = find_smallest_boundary_file(icmp, level_files, &largest_key) {
        largest_key = boundary.largest.clone();
        compaction_files.push(boundary);
    }
}

impl VersionSet {
    /// Picks level and inputs for a new compaction.
    ///
    /// Returns `None` if there is no compaction to be done.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let icmp = self.ctx.icmp.clone();

        // We prefer compactions triggered by too much data in a level over
        // the compactions triggered by seeks
        let mut c = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);

            let mut c = Compaction::new(&self.ctx.options, icmp.clone(), level);

            // Pick the first file that comes after compact_pointer[level]
            let first = current.files[level].iter().find(|f| {
                self.compact_pointers[level].as_ref().is_none_or(|ptr| {
                    icmp.compare(f.largest.encoded(), ptr.encoded()) == Ordering::Greater
                })
            });

            // Wrap-around to the beginning of the key space
            match first.or_else(|| current.files[level].first()) {
                Some(f) => c.inputs[0].push(f.clone()),
                None => return None,
            }

            c
        } else if let Some((level, f)) = current.file_to_compact() {
            let mut c = Compaction::new(&self.ctx.options, icmp.clone(), level);
            c.inputs[0].push(f);
            c
        } else {
            return None;
        };

        c.input_version = Some(current.clone());

        // Files in level 0 may overlap each other, so pick up all overlapping ones
        if c.level() == 0 {
            let (smallest, largest) = get_range(&icmp, &c.inputs[0]);

            // Note that the next call will discard the file we placed in
            // inputs[0] earlier and replace it with an overlapping set
            // which will include the picked file.
            c.inputs[0] = current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);

        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let Some(current) = c.input_version.clone() else {
            return;
        };

        let icmp = self.ctx.icmp.clone();
        let level = c.level();

        add_boundary_inputs(&icmp, &current.files[level], &mut c.inputs[0]);
        let (smallest, mut largest) = get_range(&icmp, &c.inputs[0]);

        c.inputs[1] = current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(&icmp, &current.files[level + 1], &mut c.inputs[1]);

        // Get entire range covered by compaction
        let (mut all_start, mut all_limit) =
            get_range(&icmp, c.inputs[0].iter().chain(&c.inputs[1]));

        // See if we can grow the number of inputs in "level" without
        // changing the number of "level+1" files we pick up
        if !c.inputs[1].is_empty() {
            let mut expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&icmp, &current.files[level], &mut expanded0);

            let inputs0_size = total_file_size(&c.inputs[0]);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);

            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < self.ctx.options.expanded_compaction_byte_size_limit()
            {
                let (new_start, new_limit) = get_range(&icmp, &expanded0);

                let mut expanded1 =
                    current.get_overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                add_boundary_inputs(&icmp, &current.files[level + 1], &mut expanded1);

                if expanded1.len() == c.inputs[1].len() {
                    log::info!(
                        "Expanding@{level} {}+{} ({inputs0_size}+{inputs1_size} bytes) to {}+{} ({expanded0_size}+{inputs1_size} bytes)",
                        c.inputs[0].len(),
                        c.inputs[1].len(),
                        expanded0.len(),
                        expanded1.len(),
                    );

                    largest = new_limit;
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;

                    (all_start, all_limit) =
                        get_range(&icmp, c.inputs[0].iter().chain(&c.inputs[1]));
                }
            }
        }

        // Compute the set of grandparent files that overlap this compaction
        // (parent == level+1; grandparent == level+2)
        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Update the place where we will do the next compaction for this level.
        // We update this immediately instead of waiting for the VersionEdit
        // to be applied so that if the compaction fails, we will try a different
        // key range next time.
        self.compact_pointers[level] = Some(largest.clone());
        c.edit.set_compact_pointer(level, largest);
    }

    /// Returns a compaction for the range `[begin, end]` in `level`.
    ///
    /// `None` bounds are unbounded. Returns `None` if nothing in that level
    /// overlaps the range.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();

        let mut inputs = current.get_overlapping_inputs(level, begin, end);

        if inputs.is_empty() {
            return None;
        }

        // Avoid compacting too much in one shot in case the range is large.
        // But we cannot do this for level-0 since level-0 files can overlap
        // and we must not pick one file and drop another older file if the
        // two files overlap.
        if level > 0 {
            let limit = self.ctx.options.max_file_size;
            let mut total = 0;

            if let Some(cut) = inputs.iter().position(|f| {
                total += f.file_size;
                total >= limit
            }) {
                inputs.truncate(cut + 1);
            }
        }

        let mut c = Compaction::new(&self.ctx.options, self.ctx.icmp.clone(), level);
        c.input_version = Some(current);
        c.inputs[0] = inputs;

        self.setup_other_inputs(&mut c);

        Some(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comparator::BytewiseComparator,
        value::ValueType,
        version::{edit::VersionEdit, tests::file_with_seqnos},
    };
    use test_log::test;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn numbers(files: &[Arc<FileMetaData>]) -> Vec<u64> {
        files.iter().map(|f| f.number).collect()
    }

    #[test]
    fn boundary_inputs_empty_file_set() {
        let level_files = vec![file_with_seqnos(1, "100", 2, "100", 1)];
        let mut compaction_files = vec![];

        add_boundary_inputs(&icmp(), &level_files, &mut compaction_files);
        assert!(compaction_files.is_empty());
    }

    #[test]
    fn boundary_inputs_empty_level_files() {
        let mut compaction_files = vec![file_with_seqnos(1, "100", 2, "100", 1)];

        add_boundary_inputs(&icmp(), &[], &mut compaction_files);
        assert_eq!(vec![1], numbers(&compaction_files));
    }

    #[test]
    fn boundary_inputs_no_boundary_files() {
        let f1 = file_with_seqnos(1, "100", 2, "100", 1);
        let f2 = file_with_seqnos(2, "200", 2, "200", 1);
        let f3 = file_with_seqnos(3, "300", 2, "300", 1);

        let level_files = vec![f3, f2, f1.clone()];
        let mut compaction_files = vec![f1];

        add_boundary_inputs(&icmp(), &level_files, &mut compaction_files);
        assert_eq!(vec![1], numbers(&compaction_files));
    }

    #[test]
    fn boundary_inputs_one_boundary_file() {
        let f1 = file_with_seqnos(1, "100", 3, "100", 2);
        let f2 = file_with_seqnos(2, "100", 1, "200", 3);
        let f3 = file_with_seqnos(3, "300", 2, "300", 1);

        let level_files = vec![f3, f2, f1.clone()];
        let mut compaction_files = vec![f1];

        add_boundary_inputs(&icmp(), &level_files, &mut compaction_files);
        assert_eq!(vec![1, 2], numbers(&compaction_files));
    }

    #[test]
    fn boundary_inputs_two_boundary_files() {
        let f1 = file_with_seqnos(1, "100", 6, "100", 5);
        let f2 = file_with_seqnos(2, "100", 2, "300", 1);
        let f3 = file_with_seqnos(3, "100", 4, "100", 3);

        let level_files = vec![f2, f3, f1.clone()];
        let mut compaction_files = vec![f1];

        add_boundary_inputs(&icmp(), &level_files, &mut compaction_files);
        assert_eq!(vec![1, 3, 2], numbers(&compaction_files));
    }

    #[test]
    fn boundary_inputs_disjoint_file_pointers() {
        let f1 = file_with_seqnos(1, "100", 6, "100", 5);
        let f2 = file_with_seqnos(2, "100", 6, "100", 5);
        let f3 = file_with_seqnos(3, "100", 2, "300", 1);
        let f4 = file_with_seqnos(4, "100", 4, "100", 3);

        let level_files = vec![f2, f3, f4];
        let mut compaction_files = vec![f1];

        add_boundary_inputs(&icmp(), &level_files, &mut compaction_files);
        assert_eq!(vec![1, 4, 3], numbers(&compaction_files));
    }

    fn add(edit: &mut VersionEdit, level: usize, number: u64, smallest: &str, largest: &str, size: u64) {
        edit.add_file(
            level,
            number,
            size,
            InternalKey::new(smallest.as_bytes(), 10, ValueType::Value),
            InternalKey::new(largest.as_bytes(), 10, ValueType::Value),
        );
    }

    fn version_set(folder: &std::path::Path) -> crate::Result<VersionSet> {
        use crate::{table::TableOptions, table_cache::TableCache, version::VersionContext, Options};

        VersionSet::create_new(folder, &BytewiseComparator)?;

        let options = Arc::new(Options::default());
        let table_cache = Arc::new(TableCache::new(folder, TableOptions::new(Arc::new(icmp())), 100));
        let mut vset = VersionSet::new(folder, Arc::new(VersionContext::new(options, table_cache)));
        vset.recover()?;

        Ok(vset)
    }

    #[test]
    fn pick_compaction_level0() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let mut vset = version_set(folder.path())?;

        assert!(vset.pick_compaction().is_none());

        let mut edit = VersionEdit::default();
        add(&mut edit, 0, 10, "a", "c", 1_000);
        add(&mut edit, 0, 11, "b", "d", 1_000);
        add(&mut edit, 0, 12, "x", "y", 1_000);
        add(&mut edit, 0, 13, "c", "e", 1_000);
        add(&mut edit, 1, 14, "d", "g", 1_000);
        add(&mut edit, 1, 15, "m", "n", 1_000);
        add(&mut edit, 2, 16, "a", "z", 1_000);
        vset.mark_file_number_used(16);
        vset.log_and_apply(&mut edit)?;

        assert!(vset.needs_compaction());

        let Some(c) = vset.pick_compaction() else {
            panic!("should pick a compaction");
        };

        assert_eq!(0, c.level());
        assert_eq!(vec![10, 11, 13], numbers(c.inputs(0)));
        assert_eq!(vec![14], numbers(c.inputs(1)));
        assert_eq!(vec![16], numbers(&c.grandparents));
        assert!(!c.is_trivial_move());
        assert!(vset.compact_pointers[0].is_some());

        Ok(())
    }

    #[test]
    fn compact_range_picks_overlapping_files() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let mut vset = version_set(folder.path())?;

        let mut edit = VersionEdit::default();
        add(&mut edit, 1, 10, "a", "c", 1_000);
        add(&mut edit, 1, 11, "e", "g", 1_000);
        add(&mut edit, 1, 12, "i", "k", 1_000);
        vset.mark_file_number_used(12);
        vset.log_and_apply(&mut edit)?;

        let begin = InternalKey::new(b"f", crate::value::MAX_SEQUENCE_NUMBER, ValueType::Value);
        let end = InternalKey::new(b"z", 0, ValueType::Deletion);

        let Some(c) = vset.compact_range(1, Some(&begin), Some(&end)) else {
            panic!("should pick a compaction");
        };
        assert_eq!(vec![11, 12], numbers(c.inputs(0)));
        assert!(c.inputs(1).is_empty());

        assert!(vset.compact_range(2, None, None).is_none());

        Ok(())
    }
}
