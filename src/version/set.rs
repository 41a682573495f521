// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    builder::VersionBuilder, edit::VersionEdit, level_iter::concatenating_iterator,
    meta::total_file_size, Version, VersionContext, NUM_LEVELS,
};
use crate::{
    compaction::Compaction,
    comparator::Comparator,
    file::{
        descriptor_file_name, parse_file_name, read_current_file, set_current_file, FileType,
    },
    iter::BoxedIterator,
    journal,
    merge::merging_iterator,
    value::{InternalKey, SeqNo},
    HashSet, ReadOptions,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

/// Collects the first corruption found in a manifest
#[derive(Default)]
struct ManifestReporter {
    error: Option<crate::Error>,
}

impl journal::Reporter for ManifestReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        log::error!("Manifest corruption, dropping {bytes} bytes: {reason}");

        if self.error.is_none() {
            self.error = Some(crate::Error::corruption(reason));
        }
    }
}

/// The set of versions of a database, plus the state that is persisted
/// in the manifest
///
/// Every change to the set of files goes through [`VersionSet::log_and_apply`],
/// which appends the edit to the manifest before installing the new
/// current version.
pub struct VersionSet {
    folder: PathBuf,
    pub(crate) ctx: Arc<VersionContext>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SeqNo,
    log_number: u64,

    /// 0 or the number of the journal currently being flushed
    prev_log_number: u64,

    descriptor_log: Option<journal::Writer>,

    current: Arc<Version>,

    /// Every version handed out, so files of old versions that are still
    /// being read are kept alive
    live: Vec<Weak<Version>>,

    /// Per-level key at which the next size compaction should start
    pub(crate) compact_pointers: [Option<InternalKey>; NUM_LEVELS],
}

impl VersionSet {
    pub fn new(folder: &Path, ctx: Arc<VersionContext>) -> Self {
        let mut current = Version::new(ctx.clone());
        current.finalize();

        Self {
            folder: folder.to_path_buf(),
            ctx,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: None,
            current: Arc::new(current),
            live: Vec::new(),
            compact_pointers: Default::default(),
        }
    }

    /// Writes the manifest of a new, empty database and points `CURRENT` at it.
    pub fn create_new(folder: &Path, comparator: &dyn Comparator) -> crate::Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name(comparator.name());
        edit.set_log_number(0);
        edit.set_next_file(2);
        edit.set_last_sequence(0);

        let manifest_number = 1;
        let path = descriptor_file_name(folder, manifest_number);

        log::debug!("Creating new manifest at {}", path.display());

        let result = Self::write_edit_to_new_file(&path, &edit)
            .and_then(|()| set_current_file(folder, manifest_number).map_err(Into::into));

        if result.is_err() {
            std::fs::remove_file(&path).ok();
        }

        result
    }

    fn write_edit_to_new_file(path: &Path, edit: &VersionEdit) -> crate::Result<()> {
        let mut writer = journal::Writer::new(File::create(path)?);
        writer.add_record(&edit.encode())?;
        writer.sync()
    }

    /// The version new reads should use
    #[must_use]
    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    /// Allocates a new file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Returns a file number that was allocated but not used, if it was
    /// the last one.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    /// Makes sure the file number allocator never hands out `number`.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    #[must_use]
    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    #[must_use]
    pub fn last_sequence(&self) -> SeqNo {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seqno: SeqNo) {
        debug_assert!(seqno >= self.last_sequence);
        self.last_sequence = seqno;
    }

    /// Journals with a number lower than this are no longer needed
    #[must_use]
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    #[must_use]
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    #[must_use]
    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_level_files(level)
    }

    #[must_use]
    pub fn num_level_bytes(&self, level: usize) -> u64 {
        self.current.level_bytes(level)
    }

    fn append_version(&mut self, v: Version) {
        let v = Arc::new(v);

        self.live.retain(|v| v.strong_count() > 0);
        self.live.push(Arc::downgrade(&v));

        self.current = v;
    }

    /// Returns the numbers of all files referenced by any live version.
    #[must_use]
    pub fn live_files(&self) -> HashSet<u64> {
        let mut live = HashSet::default();

        let versions = self
            .live
            .iter()
            .filter_map(Weak::upgrade)
            .chain(std::iter::once(self.current.clone()));

        for version in versions {
            for files in &version.files {
                live.extend(files.iter().map(|f| f.number));
            }
        }

        live
    }

    /// Builds an edit that recreates the current state from scratch.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name(self.ctx.icmp.user_comparator().name());

        for (level, key) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = key {
                edit.set_compact_pointer(level, key.clone());
            }
        }

        for (level, files) in self.current.files.iter().enumerate() {
            for f in files {
                edit.add_file(
                    level,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
            }
        }

        edit
    }

    /// Applies `edit` to the current version, persists it to the manifest
    /// and installs the result as the new current version.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> crate::Result<()> {
        match edit.log_number {
            Some(number) => {
                debug_assert!(number >= self.log_number);
                debug_assert!(number < self.next_file_number);
            }
            None => edit.set_log_number(self.log_number),
        }

        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }

        edit.set_next_file(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut v = Version::new(self.ctx.clone());
        {
            let mut builder = VersionBuilder::new(self.current.clone());
            builder.apply(edit);
            builder.save_to(&mut v)?;
        }
        v.finalize();

        // Initialize new descriptor log file if necessary by creating
        // a temporary file that contains a snapshot of the current version
        let mut new_manifest = None;

        if self.descriptor_log.is_none() {
            let path = descriptor_file_name(&self.folder, self.manifest_file_number);
            log::debug!("Creating manifest {}", path.display());

            let snapshot = self.snapshot_edit().encode();

            let mut writer = journal::Writer::new(File::create(&path)?);
            let result = writer.add_record(&snapshot);

            self.descriptor_log = Some(writer);
            new_manifest = Some(path);

            if let Err(e) = result {
                self.abandon_manifest(new_manifest.as_deref());
                return Err(e);
            }
        }

        if let Err(e) = self.write_to_manifest(edit, new_manifest.is_some()) {
            log::error!("Manifest write failed: {e:?}");
            self.abandon_manifest(new_manifest.as_deref());
            return Err(e);
        }

        for (level, key) in &edit.compact_pointers {
            self.compact_pointers[*level] = Some(key.clone());
        }

        self.append_version(v);

        if let Some(number) = edit.log_number {
            self.log_number = number;
        }
        if let Some(number) = edit.prev_log_number {
            self.prev_log_number = number;
        }

        Ok(())
    }

    fn write_to_manifest(&mut self, edit: &VersionEdit, new_manifest: bool) -> crate::Result<()> {
        let Some(log) = self.descriptor_log.as_mut() else {
            return Err(crate::Error::corruption("manifest is not open"));
        };

        log.add_record(&edit.encode())?;
        log.sync()?;

        // If we just created a new descriptor file, install it by writing a
        // new CURRENT file that points to it
        if new_manifest {
            set_current_file(&self.folder, self.manifest_file_number)?;
        }

        Ok(())
    }

    fn abandon_manifest(&mut self, path: Option<&Path>) {
        if let Some(path) = path {
            self.descriptor_log = None;

            if let Err(e) = std::fs::remove_file(path) {
                log::warn!("Could not delete abandoned manifest {}: {e:?}", path.display());
            }
        }
    }

    /// Restores the last persisted state from the manifest `CURRENT` points to.
    ///
    /// Returns `true` if a new manifest must be written, because the old
    /// one is not being reused.
    pub fn recover(&mut self) -> crate::Result<bool> {
        // Read "CURRENT" file, which contains a pointer to the current manifest file
        let current = read_current_file(&self.folder)?;
        let descriptor_path = self.folder.join(&current);

        log::debug!("Recovering from manifest {}", descriptor_path.display());

        let file = match File::open(&descriptor_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(crate::Error::corruption(
                    "CURRENT points to a non-existent file",
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file = None;
        let mut last_sequence = None;

        let mut builder = VersionBuilder::new(self.current.clone());
        let mut read_records = 0;
        let mut reporter = ManifestReporter::default();

        {
            let mut reader = journal::Reader::new(file, Some(&mut reporter), true, 0);

            while let Some(record) = reader.read_record() {
                read_records += 1;

                let edit = VersionEdit::decode(&record)?;

                if let Some(name) = &edit.comparator {
                    let expected = self.ctx.icmp.user_comparator().name();

                    if name != expected {
                        return Err(crate::Error::InvalidArgument(format!(
                            "{name} does not match existing comparator {expected}"
                        )));
                    }
                }

                builder.apply(&edit);

                for (level, key) in &edit.compact_pointers {
                    self.compact_pointers[*level] = Some(key.clone());
                }

                log_number = edit.log_number.or(log_number);
                prev_log_number = edit.prev_log_number.or(prev_log_number);
                next_file = edit.next_file_number.or(next_file);
                last_sequence = edit.last_sequence.or(last_sequence);
            }
        }

        if let Some(e) = reporter.error {
            return Err(e);
        }

        let Some(next_file) = next_file else {
            return Err(crate::Error::corruption("no meta-nextfile entry in descriptor"));
        };
        let Some(log_number) = log_number else {
            return Err(crate::Error::corruption("no meta-lognumber entry in descriptor"));
        };
        let Some(last_sequence) = last_sequence else {
            return Err(crate::Error::corruption(
                "no last-sequence-number entry in descriptor",
            ));
        };
        let prev_log_number = prev_log_number.unwrap_or_default();

        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        let mut v = Version::new(self.ctx.clone());
        builder.save_to(&mut v)?;
        v.finalize();
        self.append_version(v);

        self.manifest_file_number = next_file;
        self.next_file_number = next_file + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        log::debug!(
            "Recovered {read_records} manifest records: manifest={current}, next_file={}, last_seq={}, log={}, prev_log={}",
            self.next_file_number,
            self.last_sequence,
            self.log_number,
            self.prev_log_number,
        );

        // See if we can reuse the existing manifest file
        Ok(!self.reuse_manifest(&descriptor_path, &current))
    }

    fn reuse_manifest(&mut self, path: &Path, name: &str) -> bool {
        if !self.ctx.options.reuse_logs {
            return false;
        }

        let Some((number, FileType::Descriptor)) = parse_file_name(name) else {
            return false;
        };

        let Ok(size) = std::fs::metadata(path).map(|m| m.len()) else {
            return false;
        };

        // Make new compacted manifest if old one is too big
        if size >= self.ctx.options.max_file_size {
            return false;
        }

        let file = match std::fs::OpenOptions::new().append(true).open(path) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Could not reuse manifest {}: {e:?}", path.display());
                return false;
            }
        };

        log::debug!("Reusing manifest {}", path.display());

        self.descriptor_log = Some(journal::Writer::with_offset(file, size));
        self.manifest_file_number = number;

        true
    }

    /// Returns `true` if some level needs a compaction.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.file_to_compact().is_some()
    }

    /// Returns the approximate offset of `key` in the data of `v`.
    #[must_use]
    pub fn approximate_offset_of(&self, v: &Version, key: &InternalKey) -> u64 {
        v.approximate_offset_of(key)
    }

    /// Returns the maximum overlapping data (in bytes) at next level for
    /// any file at a level >= 1.
    #[must_use]
    pub fn max_next_level_overlapping_bytes(&self) -> u64 {
        let mut result = 0;

        for level in 1..NUM_LEVELS - 1 {
            for f in &self.current.files[level] {
                let overlaps = self.current.get_overlapping_inputs(
                    level + 1,
                    Some(&f.smallest),
                    Some(&f.largest),
                );
                result = result.max(total_file_size(&overlaps));
            }
        }

        result
    }

    /// Returns a one-line summary of the file count of each level.
    #[must_use]
    pub fn level_summary(&self) -> String {
        let counts = self
            .current
            .files
            .iter()
            .map(|files| files.len().to_string())
            .collect::<Vec<_>>();

        format!("files[ {} ]", counts.join(" "))
    }

    /// Creates an iterator that reads over the compaction inputs of `c`.
    pub fn make_input_iterator(&self, c: &Compaction) -> BoxedIterator {
        let opts = ReadOptions {
            verify_checksums: self.ctx.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        // Level-0 files have to be merged together. For other levels,
        // we will make a concatenating iterator per level.
        let mut list = Vec::with_capacity(c.num_input_files(0) + 1);

        for which in 0..2 {
            let files = c.inputs(which);

            if files.is_empty() {
                continue;
            }

            if c.level() + which == 0 {
                for f in files {
                    list.push(self.ctx.table_cache.iter(&opts, f.number, f.file_size));
                }
            } else {
                list.push(concatenating_iterator(
                    &self.ctx.icmp,
                    &self.ctx.table_cache,
                    files.to_vec(),
                    &opts,
                ));
            }
        }

        merging_iterator(Arc::new(self.ctx.icmp.clone()), list)
    }
}
