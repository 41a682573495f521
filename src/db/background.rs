// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{DbInner, DbState, StateGuard};
use crate::{
    file::{parse_file_name, FileType},
    flush::build_table,
    memtable::MemTable,
    version::{edit::VersionEdit, meta::FileMetaData, Version},
};
use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

impl DbInner {
    /// Body of the background thread
    ///
    /// Sleeps until work is scheduled, and exits once the database shuts down.
    pub(super) fn background_thread(&self) {
        log::debug!("background thread: started");

        let mut state = self.lock_state();

        loop {
            while !state.background_compaction_scheduled && !self.is_shutting_down() {
                state = self
                    .background_work_scheduled
                    .wait(state)
                    .expect("lock is poisoned");
            }

            if self.is_shutting_down() {
                break;
            }

            state = self.background_call(state);
        }

        state.background_compaction_scheduled = false;
        self.background_work_finished.notify_all();

        log::debug!("background thread: exiting because database is closing");
    }

    pub(super) fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.background_compaction_scheduled {
            // Already scheduled
        } else if self.is_shutting_down() {
            // DB is being deleted; no more background compactions
        } else if state.bg_error.is_some() {
            // Already got an error; no more changes
        } else if state.imm.is_none()
            && state.manual_compaction.is_none()
            && !state.versions.needs_compaction()
        {
            // No work to be done
        } else {
            state.background_compaction_scheduled = true;
            self.background_work_scheduled.notify_all();
        }
    }

    fn background_call<'a>(&'a self, mut state: StateGuard<'a>) -> StateGuard<'a> {
        debug_assert!(state.background_compaction_scheduled);

        if self.is_shutting_down() {
            // No more background work when shutting down
        } else if state.bg_error.is_some() {
            // No more background work after a background error
        } else {
            state = self.background_compaction(state);
        }

        if self.version_ctx.obsolete_files.swap(false, Ordering::AcqRel) {
            state = self.remove_obsolete_files(state);
        }

        state.background_compaction_scheduled = false;

        // Previous compaction may have produced too many files in a level,
        // so reschedule another compaction if needed.
        self.maybe_schedule_compaction(&mut state);
        self.background_work_finished.notify_all();

        state
    }

    fn background_compaction<'a>(&'a self, mut state: StateGuard<'a>) -> StateGuard<'a> {
        if state.imm.is_some() {
            return self.compact_memtable(state);
        }

        let st = &mut *state;
        let is_manual = st.manual_compaction.is_some();
        let mut manual_end = None;

        let compaction = if let Some(manual) = &mut st.manual_compaction {
            let compaction = st.versions.compact_range(
                manual.level,
                manual.begin.as_ref(),
                manual.end.as_ref(),
            );

            manual.done = compaction.is_none();

            if let Some(c) = &compaction {
                manual_end = c.inputs(0).last().map(|f| f.largest.clone());
            }

            self.info_log.log(format_args!(
                "Manual compaction at level-{} from {:?} .. {:?}; will stop at {:?}",
                manual.level, manual.begin, manual.end, manual_end,
            ));

            compaction
        } else {
            st.versions.pick_compaction()
        };

        let mut result = Ok(());

        let mut state = match compaction {
            None => {
                // Nothing to do
                state
            }
            Some(mut c) if !is_manual && c.is_trivial_move() => {
                // Move file to next level
                let mut state = state;
                let level = c.level();

                if let Some(f) = c.input(0, 0).cloned() {
                    c.edit.remove_file(level, f.number);
                    c.edit.add_file(
                        level + 1,
                        f.number,
                        f.file_size,
                        f.smallest.clone(),
                        f.largest.clone(),
                    );

                    result = state.versions.log_and_apply(&mut c.edit);

                    if let Err(e) = &result {
                        self.record_background_error(&mut state, e.clone());
                    }

                    self.info_log.log(format_args!(
                        "Moved #{} to level-{} {} bytes {}: {}",
                        f.number,
                        level + 1,
                        f.file_size,
                        status_string(&result),
                        state.versions.level_summary(),
                    ));
                }

                state
            }
            Some(c) => {
                let (state, compaction_result) = self.do_compaction_work(state, c);
                result = compaction_result;
                self.remove_obsolete_files(state)
            }
        };

        if let Err(e) = &result {
            if self.is_shutting_down() {
                // Ignore compaction errors found during shutting down
            } else {
                self.info_log
                    .log(format_args!("Compaction error: {e}"));
            }
        }

        if is_manual {
            let done = match &mut state.manual_compaction {
                Some(manual) => {
                    if result.is_err() {
                        manual.done = true;
                    }

                    if !manual.done {
                        // Only compacted part of the requested range.
                        // Update the range to the remaining part.
                        manual.begin = manual_end;
                    }

                    manual.done
                }
                None => false,
            };

            if done {
                state.manual_compaction = None;
            }
        }

        state
    }

    /// Flushes the immutable memtable into a table and installs it.
    pub(super) fn compact_memtable<'a>(&'a self, mut state: StateGuard<'a>) -> StateGuard<'a> {
        let Some(imm) = state.imm.clone() else {
            return state;
        };

        // Save the contents of the memtable as a new table
        let mut edit = VersionEdit::default();
        let base = state.versions.current();
        let number = Self::start_level0_table(&mut state);

        drop(state);

        let start = Instant::now();
        let built = build_table(&self.folder, &self.table_cache, &mut imm.iter(), number);

        let mut state = self.lock_state();
        let mut result = self.finish_level0_table(
            &mut state,
            number,
            built,
            &mut edit,
            Some(&base),
            start.elapsed(),
        );

        drop(base);

        if result.is_ok() && self.is_shutting_down() {
            result = Err(crate::Error::ShuttingDown);
        }

        if result.is_ok() {
            // Earlier journals are no longer needed
            edit.set_prev_log_number(0);
            edit.set_log_number(state.logfile_number);
            result = state.versions.log_and_apply(&mut edit);
        }

        match result {
            Ok(()) => {
                // Commit to the new state
                state.imm = None;
                self.has_imm.store(false, Ordering::Release);
                self.remove_obsolete_files(state)
            }
            Err(e) => {
                self.record_background_error(&mut state, e);
                state
            }
        }
    }

    /// Allocates the number of a new level-0 table.
    ///
    /// The number stays protected from deletion until
    /// [`DbInner::finish_level0_table`] is called.
    pub(super) fn start_level0_table(state: &mut DbState) -> u64 {
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        number
    }

    /// Records a table built from a memtable in `edit`.
    ///
    /// The table is placed at level 0, or deeper if `base` is given and
    /// the table does not overlap anything there.
    pub(super) fn finish_level0_table(
        &self,
        state: &mut DbState,
        number: u64,
        built: crate::Result<Option<FileMetaData>>,
        edit: &mut VersionEdit,
        base: Option<&Version>,
        elapsed: Duration,
    ) -> crate::Result<()> {
        state.pending_outputs.remove(&number);

        let meta = match built {
            Ok(meta) => meta,
            Err(e) => {
                self.info_log
                    .log(format_args!("Level-0 table #{number}: {e}"));
                return Err(e);
            }
        };

        // Note that if the memtable was empty, no file was created and
        // nothing should be added to the manifest.
        let Some(meta) = meta else {
            self.info_log
                .log(format_args!("Level-0 table #{number}: 0 bytes OK"));
            return Ok(());
        };

        self.info_log.log(format_args!(
            "Level-0 table #{number}: {} bytes OK",
            meta.file_size
        ));

        let level = base.map_or(0, |base| {
            base.pick_level_for_memtable_output(meta.smallest.user_key(), meta.largest.user_key())
        });

        state.stats[level].add(elapsed, 0, meta.file_size);

        edit.add_file(
            level,
            meta.number,
            meta.file_size,
            meta.smallest,
            meta.largest,
        );

        Ok(())
    }

    /// Builds a level-0 table from `mem` without releasing the lock.
    pub(super) fn write_level0_table(
        &self,
        state: &mut DbState,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
    ) -> crate::Result<()> {
        let number = Self::start_level0_table(state);

        let start = Instant::now();
        let built = build_table(&self.folder, &self.table_cache, &mut mem.iter(), number);

        self.finish_level0_table(state, number, built, edit, None, start.elapsed())
    }

    pub(super) fn record_background_error(&self, state: &mut DbState, error: crate::Error) {
        if state.bg_error.is_none() {
            log::error!("Background error: {error:?}");
            self.info_log
                .log(format_args!("Background error: {error}"));

            state.bg_error = Some(Arc::new(error));
            self.background_work_finished.notify_all();
        }
    }

    /// Deletes all files that are no longer needed.
    ///
    /// The file list is gathered under the lock; the files are deleted
    /// with the lock released.
    pub(super) fn remove_obsolete_files<'a>(&'a self, state: StateGuard<'a>) -> StateGuard<'a> {
        if state.bg_error.is_some() {
            // After a background error, we don't know whether a new
            // version may or may not have been committed, so we cannot
            // safely garbage collect.
            return state;
        }

        // Make a set of all of the live files
        let mut live = state.pending_outputs.clone();
        live.extend(state.versions.live_files());

        let entries = match std::fs::read_dir(&self.folder) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Could not list {}: {e:?}", self.folder.display());
                return state;
            }
        };

        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_file_number = state.versions.manifest_file_number();

        let mut files_to_delete = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name();

            let Some((number, file_type)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };

            let keep = match file_type {
                FileType::Log => number >= log_number || number == prev_log_number,

                // Keep my manifest file, and any newer incarnations'
                FileType::Descriptor => number >= manifest_file_number,

                // Temp files that are currently being written to must be
                // recorded in pending outputs, which is inserted into "live"
                FileType::Table | FileType::Temp => live.contains(&number),

                FileType::Current | FileType::DbLock | FileType::InfoLog => true,
            };

            if !keep {
                if file_type == FileType::Table {
                    self.table_cache.evict(number);
                }

                self.info_log
                    .log(format_args!("Delete type={file_type:?} #{number}"));

                files_to_delete.push(entry.path());
            }
        }

        // While deleting all files unblock other threads. All files being
        // deleted have unique names which will not collide with newly
        // created files and are therefore safe to delete while allowing
        // other threads to proceed.
        drop(state);

        for path in files_to_delete {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Could not delete {}: {e:?}", path.display());
            }
        }

        self.lock_state()
    }
}

pub(super) fn status_string(result: &crate::Result<()>) -> String {
    match result {
        Ok(()) => "OK".into(),
        Err(e) => e.to_string(),
    }
}
