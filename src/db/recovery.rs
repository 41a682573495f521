// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{DbInner, DbState};
use crate::{
    batch::WriteBatch,
    file::{log_file_name, parse_file_name, table_file_name, FileType, CURRENT_FILE},
    info_log::InfoLog,
    journal::{self, reader::Reporter},
    memtable::MemTable,
    value::SeqNo,
    version::{edit::VersionEdit, set::VersionSet},
};
use std::{cell::RefCell, fs::File, path::PathBuf, sync::Arc};

/// Collects corruption found while replaying a journal
///
/// Without paranoid checks, corruption is logged and skipped.
struct LogCorruption<'a> {
    path: PathBuf,
    info_log: &'a InfoLog,
    paranoid: bool,
    error: RefCell<Option<crate::Error>>,
}

impl LogCorruption<'_> {
    fn report(&self, bytes: usize, reason: &str) {
        self.info_log.log(format_args!(
            "{}{}: dropping {bytes} bytes; {reason}",
            self.path.display(),
            if self.paranoid { "" } else { " (ignoring error)" },
        ));

        if self.paranoid {
            self.error
                .borrow_mut()
                .get_or_insert_with(|| crate::Error::corruption(reason));
        }
    }

    fn has_error(&self) -> bool {
        self.error.borrow().is_some()
    }
}

struct LogReporter<'a, 'b>(&'a LogCorruption<'b>);

impl Reporter for LogReporter<'_, '_> {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        self.0.report(bytes, reason);
    }
}

impl DbInner {
    /// Recovers the last persisted state: the manifest, then every
    /// journal that is newer than the manifest's log number.
    ///
    /// Returns `true` if the manifest needs to be rewritten.
    pub(super) fn recover(
        &self,
        state: &mut DbState,
        edit: &mut VersionEdit,
    ) -> crate::Result<bool> {
        if self.folder.join(CURRENT_FILE).try_exists()? {
            if self.options.error_if_exists {
                return Err(crate::Error::InvalidArgument(format!(
                    "{}: exists (error_if_exists is true)",
                    self.folder.display()
                )));
            }
        } else if self.options.create_if_missing {
            log::info!("Creating database at {}", self.folder.display());
            VersionSet::create_new(&self.folder, self.options.comparator.as_ref())?;
        } else {
            return Err(crate::Error::InvalidArgument(format!(
                "{}: does not exist (create_if_missing is false)",
                self.folder.display()
            )));
        }

        let mut save_manifest = state.versions.recover()?;
        let mut max_sequence: SeqNo = 0;

        // Recover from all newer journals than the ones named in the
        // descriptor (new journals may have been added by the previous
        // incarnation without registering them in the descriptor).
        //
        // Note that prev_log_number is no longer used, but we pay
        // attention to it in case we are recovering a database produced
        // by an older version.
        let min_log = state.versions.log_number();
        let prev_log = state.versions.prev_log_number();

        let mut expected = state.versions.live_files();
        let mut logs = Vec::new();

        for entry in std::fs::read_dir(&self.folder)? {
            let entry = entry?;
            let name = entry.file_name();

            let Some((number, file_type)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };

            expected.remove(&number);

            if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                logs.push(number);
            }
        }

        if let Some(missing) = expected.iter().min() {
            return Err(crate::Error::corruption(format!(
                "{} missing files; e.g.: {}",
                expected.len(),
                table_file_name(&self.folder, *missing).display(),
            )));
        }

        // Recover in the order in which the journals were generated
        logs.sort_unstable();

        for (idx, &number) in logs.iter().enumerate() {
            let last_log = idx + 1 == logs.len();

            self.recover_log_file(
                state,
                number,
                last_log,
                &mut save_manifest,
                edit,
                &mut max_sequence,
            )?;

            // The previous incarnation may not have written any MANIFEST
            // records after allocating this log number. So we manually
            // update the file number allocation counter in VersionSet.
            state.versions.mark_file_number_used(number);
        }

        if state.versions.last_sequence() < max_sequence {
            state.versions.set_last_sequence(max_sequence);
        }

        Ok(save_manifest)
    }

    /// Replays one journal into a memtable, flushing to level-0 tables
    /// whenever the memtable fills up.
    fn recover_log_file(
        &self,
        state: &mut DbState,
        log_number: u64,
        last_log: bool,
        save_manifest: &mut bool,
        edit: &mut VersionEdit,
        max_sequence: &mut SeqNo,
    ) -> crate::Result<()> {
        let path = log_file_name(&self.folder, log_number);
        let file = File::open(&path)?;

        self.info_log
            .log(format_args!("Recovering log #{log_number}"));

        let corruption = LogCorruption {
            path: path.clone(),
            info_log: &self.info_log,
            paranoid: self.options.paranoid_checks,
            error: RefCell::new(None),
        };

        let mut reporter = LogReporter(&corruption);

        // We intentionally make the reader do checksumming even if
        // paranoid checks are off so that corruptions cause entire
        // commits to be skipped instead of propagating bad information
        // (like overly large sequence numbers).
        let mut reader = journal::Reader::new(file, Some(&mut reporter), true, 0);

        let mut batch = WriteBatch::new();
        let mut mem: Option<Arc<MemTable>> = None;
        let mut compactions = 0;

        while let Some(record) = reader.read_record() {
            if corruption.has_error() {
                break;
            }

            if let Err(e) = batch.set_contents(&record) {
                corruption.report(record.len(), &e.to_string());
                continue;
            }

            // Empty batches consume no sequence number
            if batch.is_empty() {
                continue;
            }

            let table = mem.get_or_insert_with(|| Arc::new(MemTable::new(self.icmp.clone())));

            if let Err(e) = batch.insert_into(table) {
                if self.options.paranoid_checks {
                    return Err(e);
                }

                self.info_log.log(format_args!("Ignoring error {e}"));
                continue;
            }

            let last_seq = batch.sequence() + u64::from(batch.count()) - 1;
            *max_sequence = (*max_sequence).max(last_seq);

            if table.approximate_memory_usage() > self.options.write_buffer_size {
                compactions += 1;
                *save_manifest = true;

                if let Some(full) = mem.take() {
                    self.write_level0_table(state, &full, edit)?;
                }
            }
        }

        drop(reader);

        if let Some(e) = corruption.error.into_inner() {
            return Err(e);
        }

        // See if we should keep reusing the last journal file
        if self.options.reuse_logs && last_log && compactions == 0 {
            let size = std::fs::metadata(&path)?.len();
            let file = std::fs::OpenOptions::new().append(true).open(&path)?;

            self.info_log
                .log(format_args!("Reusing old log {}", path.display()));

            *self.log.lock().expect("lock is poisoned") =
                Some(journal::Writer::with_offset(file, size));

            state.logfile_number = log_number;

            if let Some(mem) = mem.take() {
                state.mem = mem;
            }
        }

        if let Some(mem) = mem {
            // mem did not get reused; compact it
            *save_manifest = true;
            self.write_level0_table(state, &mem, edit)?;
        }

        Ok(())
    }
}
