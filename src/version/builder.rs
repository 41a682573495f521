// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{edit::VersionEdit, meta::FileMetaData, Version, NUM_LEVELS};
use crate::{comparator::Comparator, HashSet};
use std::{cmp::Ordering, sync::Arc};

#[derive(Default)]
struct LevelState {
    deleted_files: HashSet<u64>,
    added_files: Vec<Arc<FileMetaData>>,
}

/// Applies a sequence of edits to a base version without creating the
/// intermediate versions
pub struct VersionBuilder {
    base: Arc<Version>,
    levels: [LevelState; NUM_LEVELS],
}

impl VersionBuilder {
    pub fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            levels: Default::default(),
        }
    }

    /// Applies all file changes of the edit.
    pub fn apply(&mut self, edit: &VersionEdit) {
        let divisor = self.base.ctx.options.allowed_seeks_divisor;

        for &(level, number) in &edit.deleted_files {
            self.levels[level].deleted_files.insert(number);
        }

        for (level, f) in &edit.new_files {
            let f = Arc::new(f.clone());
            f.init_allowed_seeks(divisor);

            let state = &mut self.levels[*level];
            state.deleted_files.remove(&f.number);
            state.added_files.push(f);
        }
    }

    /// Writes the files of the base version plus the applied edits into `v`.
    pub fn save_to(&self, v: &mut Version) -> crate::Result<()> {
        let icmp = &self.base.ctx.icmp;

        let by_smallest_key = |a: &Arc<FileMetaData>, b: &Arc<FileMetaData>| {
            icmp.compare(a.smallest.encoded(), b.smallest.encoded())
                .then_with(|| a.number.cmp(&b.number))
        };

        for (level, state) in self.levels.iter().enumerate() {
            let mut added = state.added_files.clone();
            added.sort_by(by_smallest_key);

            let base_files = &self.base.files[level];
            let mut files: Vec<Arc<FileMetaData>> =
                Vec::with_capacity(base_files.len() + added.len());

            // Merge the sorted base files with the sorted added files
            let mut base_iter = base_files.iter().peekable();

            for f in added {
                while let Some(base_file) =
                    base_iter.next_if(|b| by_smallest_key(b, &f) == Ordering::Less)
                {
                    Self::maybe_add_file(state, &mut files, level, base_file.clone(), icmp)?;
                }
                Self::maybe_add_file(state, &mut files, level, f, icmp)?;
            }

            for base_file in base_iter {
                Self::maybe_add_file(state, &mut files, level, base_file.clone(), icmp)?;
            }

            v.files[level] = files;
        }

        Ok(())
    }

    fn maybe_add_file(
        state: &LevelState,
        files: &mut Vec<Arc<FileMetaData>>,
        level: usize,
        f: Arc<FileMetaData>,
        icmp: &impl Comparator,
    ) -> crate::Result<()> {
        if state.deleted_files.contains(&f.number) {
            // File is deleted: do nothing
            return Ok(());
        }

        // Level-0 files may overlap each other
        if level > 0 {
            if let Some(last) = files.last() {
                if icmp.compare(last.largest.encoded(), f.smallest.encoded()) != Ordering::Less {
                    log::error!("Overlapping files in L{level}: {last:?} and {f:?}");
                    return Err(crate::Error::corruption(format!(
                        "overlapping ranges in same level {level}"
                    )));
                }
            }
        }

        files.push(f);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        value::{InternalKey, ValueType},
        version::tests::{file, test_context},
    };
    use test_log::test;

    fn numbers(files: &[Arc<FileMetaData>]) -> Vec<u64> {
        files.iter().map(|f| f.number).collect()
    }

    fn add(edit: &mut VersionEdit, level: usize, number: u64, smallest: &str, largest: &str) {
        edit.add_file(
            level,
            number,
            1_000,
            InternalKey::new(smallest.as_bytes(), 5, ValueType::Value),
            InternalKey::new(largest.as_bytes(), 5, ValueType::Value),
        );
    }

    #[test]
    fn version_builder_add_and_delete() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let ctx = test_context(folder.path());

        let mut base = Version::new(ctx.clone());
        base.files[1] = vec![file(1, "a", "c"), file(2, "m", "o")];
        let base = Arc::new(base);

        let mut edit = VersionEdit::default();
        add(&mut edit, 1, 3, "e", "g");
        add(&mut edit, 1, 4, "x", "z");
        add(&mut edit, 0, 5, "a", "z");
        edit.remove_file(1, 1);

        let mut builder = VersionBuilder::new(base);
        builder.apply(&edit);

        let mut v = Version::new(ctx);
        builder.save_to(&mut v)?;

        assert_eq!(vec![5], numbers(&v.files[0]));
        assert_eq!(vec![3, 2, 4], numbers(&v.files[1]));

        // Added files get a fresh seek budget
        assert!(v.files[1][0].allowed_seeks.load(std::sync::atomic::Ordering::Relaxed) >= 100);

        Ok(())
    }

    #[test]
    fn version_builder_delete_then_add_again() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let ctx = test_context(folder.path());

        let mut first = VersionEdit::default();
        add(&mut first, 2, 7, "a", "b");

        let mut second = VersionEdit::default();
        second.remove_file(2, 7);

        let mut third = VersionEdit::default();
        add(&mut third, 3, 7, "a", "b");

        let mut builder = VersionBuilder::new(Arc::new(Version::new(ctx.clone())));
        builder.apply(&first);
        builder.apply(&second);
        builder.apply(&third);

        let mut v = Version::new(ctx);
        builder.save_to(&mut v)?;

        assert!(v.files[2].is_empty());
        assert_eq!(vec![7], numbers(&v.files[3]));

        Ok(())
    }

    #[test]
    fn version_builder_level0_may_overlap() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let ctx = test_context(folder.path());

        let mut edit = VersionEdit::default();
        add(&mut edit, 0, 1, "a", "m");
        add(&mut edit, 0, 2, "c", "z");

        let mut builder = VersionBuilder::new(Arc::new(Version::new(ctx.clone())));
        builder.apply(&edit);

        let mut v = Version::new(ctx);
        builder.save_to(&mut v)?;
        assert_eq!(vec![1, 2], numbers(&v.files[0]));

        Ok(())
    }

    #[test]
    fn version_builder_rejects_overlap() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let ctx = test_context(folder.path());

        let mut edit = VersionEdit::default();
        add(&mut edit, 1, 1, "a", "m");
        add(&mut edit, 1, 2, "c", "z");

        let mut builder = VersionBuilder::new(Arc::new(Version::new(ctx.clone())));
        builder.apply(&edit);

        let mut v = Version::new(ctx);
        assert!(matches!(
            builder.save_to(&mut v),
            Err(crate::Error::Corruption(_))
        ));

        Ok(())
    }
}
