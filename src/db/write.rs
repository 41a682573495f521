// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{DbInner, DbState, PendingWrite, StateGuard};
use crate::{
    batch::WriteBatch, file::log_file_name, journal, memtable::MemTable, WriteOptions,
};
use std::{fs::File, sync::Arc, time::Duration};

/// Largest group of batches committed by one journal append
const MAX_GROUP_SIZE: usize = /* 1 MiB */ 1_024 * 1_024;

/// Batches up to this size only allow the group to grow by the same amount,
/// so small writes are not slowed down too much
const SMALL_BATCH_SIZE: usize = /* 128 KiB */ 128 * 1_024;

impl DbInner {
    /// Queues a write and waits until it is committed.
    ///
    /// The writer at the front of the queue commits the batches of the
    /// writers queued behind it as a single group, so many concurrent
    /// writes share one journal append (and one sync).
    ///
    /// A `None` batch forces the memtable to be frozen.
    pub(super) fn write(
        &self,
        opts: &WriteOptions,
        batch: Option<WriteBatch>,
    ) -> crate::Result<()> {
        if self.is_shutting_down() {
            return Err(crate::Error::ShuttingDown);
        }

        let mut state = self.lock_state();

        let id = state.next_writer_id;
        state.next_writer_id += 1;

        state.writers.push_back(PendingWrite {
            id,
            batch,
            sync: opts.sync,
        });

        loop {
            if let Some(result) = state.finished_writes.remove(&id) {
                // Someone else did the work for us
                return result;
            }

            if state.writers.front().is_some_and(|w| w.id == id) {
                break;
            }

            state = self.writers_done.wait(state).expect("lock is poisoned");
        }

        let force = state.writers.front().is_some_and(|w| w.batch.is_none());

        // May temporarily unlock and wait
        let (mut state, mut result) = self.make_room_for_write(state, force);
        let mut last_writer = id;

        if result.is_ok() && !force {
            let (mut group, group_last_writer, sync) = Self::build_batch_group(&mut state);
            last_writer = group_last_writer;

            let last_sequence = state.versions.last_sequence();
            group.set_sequence(last_sequence + 1);

            let mem = state.mem.clone();

            // Add to the journal and apply to the memtable. We can release
            // the lock during this phase since we are the only writer that
            // touches the journal and memtable.
            drop(state);

            let log_result = self.append_to_log(&group, sync);
            result = log_result
                .clone()
                .and_then(|()| group.insert_into(&mem));

            state = self.lock_state();

            if let Err(e) = log_result {
                // The state of the journal file is indeterminate: the record
                // we just added may or may not show up when the database is
                // re-opened. So we force the database into a mode where all
                // future writes fail.
                self.record_background_error(&mut state, e);
            }

            state
                .versions
                .set_last_sequence(last_sequence + u64::from(group.count()));
        }

        while let Some(writer) = state.writers.pop_front() {
            if writer.id != id {
                state.finished_writes.insert(writer.id, result.clone());
            }

            if writer.id == last_writer {
                break;
            }
        }

        // Notify the new head of the write queue, and the writers we wrote for
        self.writers_done.notify_all();

        result
    }

    /// Merges the batches at the front of the writer queue into one.
    ///
    /// Returns the merged batch, the id of the last writer included and
    /// whether the group must be synced.
    fn build_batch_group(state: &mut DbState) -> (WriteBatch, u64, bool) {
        let mut writers = state.writers.iter_mut();

        let Some(first) = writers.next() else {
            return (WriteBatch::new(), 0, false);
        };

        let mut group = first.batch.take().unwrap_or_default();
        let sync = first.sync;
        let mut last_writer = first.id;

        // Allow the group to grow up to a maximum size, but if the
        // original write is small, limit the growth so we do not slow
        // down the small write too much.
        let size = group.approximate_size();
        let max_size = if size <= SMALL_BATCH_SIZE {
            size + SMALL_BATCH_SIZE
        } else {
            MAX_GROUP_SIZE
        };

        for writer in writers {
            if writer.sync && !sync {
                // Do not include a sync write into a group handled by a non-sync write
                break;
            }

            let Some(batch) = &writer.batch else {
                // Do not include forced memtable switches
                break;
            };

            if group.approximate_size() + batch.approximate_size() > max_size {
                // Do not make the group too big
                break;
            }

            group.append(batch);
            writer.batch = None;
            last_writer = writer.id;
        }

        (group, last_writer, sync)
    }

    fn append_to_log(&self, group: &WriteBatch, sync: bool) -> crate::Result<()> {
        let mut log = self.log.lock().expect("lock is poisoned");

        let Some(log) = log.as_mut() else {
            return Err(crate::Error::ShuttingDown);
        };

        log.add_record(group.contents())?;

        if sync {
            log.sync()?;
        }

        Ok(())
    }

    /// Makes sure there is room in the memtable for the next write.
    ///
    /// Freezes the memtable when it is full (or `force` is set), and
    /// applies backpressure when level 0 fills up faster than it can be
    /// compacted.
    pub(super) fn make_room_for_write<'a>(
        &'a self,
        mut state: StateGuard<'a>,
        mut force: bool,
    ) -> (StateGuard<'a>, crate::Result<()>) {
        let options = &self.options;
        let mut allow_delay = !force;

        loop {
            if let Some(e) = &state.bg_error {
                // Yield previous error
                let e = crate::Error::Background(e.clone());
                return (state, Err(e));
            }

            if self.is_shutting_down() {
                return (state, Err(crate::Error::ShuttingDown));
            }

            let level0_files = state.versions.num_level_files(0);

            if allow_delay && level0_files >= options.level0_slowdown_writes_trigger {
                // We are getting close to hitting a hard limit on the
                // number of L0 files. Rather than delaying a single write
                // by several seconds when we hit the hard limit, start
                // delaying each individual write by 1ms to reduce latency
                // variance. Also, this delay hands over some CPU to the
                // compaction thread in case it is sharing the same core as
                // the writer.
                drop(state);
                std::thread::sleep(Duration::from_millis(1));

                // Do not delay a single write more than once
                allow_delay = false;
                state = self.lock_state();
            } else if !force
                && state.mem.approximate_memory_usage() <= options.write_buffer_size
            {
                // There is room in current memtable
                break;
            } else if state.imm.is_some() {
                // We have filled up the current memtable, but the previous
                // one is still being compacted, so we wait.
                self.info_log
                    .log(format_args!("Current memtable full; waiting..."));

                state = self
                    .background_work_finished
                    .wait(state)
                    .expect("lock is poisoned");
            } else if level0_files >= options.level0_stop_writes_trigger {
                // There are too many level-0 files
                self.info_log
                    .log(format_args!("Too many L0 files; waiting..."));

                state = self
                    .background_work_finished
                    .wait(state)
                    .expect("lock is poisoned");
            } else {
                // Attempt to switch to a new memtable and trigger compaction of old
                if let Err(e) = self.switch_memtable(&mut state) {
                    return (state, Err(e));
                }

                // Do not force another compaction if we have room
                force = false;
                self.maybe_schedule_compaction(&mut state);
            }
        }

        (state, Ok(()))
    }

    /// Freezes the active memtable and starts a new journal for its successor.
    fn switch_memtable(&self, state: &mut DbState) -> crate::Result<()> {
        debug_assert!(state.imm.is_none());

        let new_log_number = state.versions.new_file_number();

        let file = match File::create(log_file_name(&self.folder, new_log_number)) {
            Ok(file) => file,
            Err(e) => {
                // Avoid chewing through file number space in a tight loop
                state.versions.reuse_file_number(new_log_number);
                return Err(e.into());
            }
        };

        log::debug!("Switching to journal #{new_log_number}");

        let old_log = self
            .log
            .lock()
            .expect("lock is poisoned")
            .replace(journal::Writer::new(file));

        if let Some(mut old_log) = old_log {
            if let Err(e) = old_log.flush() {
                // We may have lost writes to the previous journal
                self.record_background_error(state, e);
            }
        }

        state.logfile_number = new_log_number;

        let old_mem = std::mem::replace(
            &mut state.mem,
            Arc::new(MemTable::new(self.icmp.clone())),
        );
        state.imm = Some(old_mem);
        self.has_imm.store(true, std::sync::atomic::Ordering::Release);

        Ok(())
    }
}
