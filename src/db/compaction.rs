// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{background::status_string, DbInner, DbState, StateGuard};
use crate::{
    compaction::Compaction,
    file::table_file_name,
    iter::InternalIterator,
    table::TableBuilder,
    value::{InternalKey, ParsedInternalKey, SeqNo, ValueType, MAX_SEQUENCE_NUMBER},
    version::meta::total_file_size,
    ReadOptions,
};
use std::{cmp::Ordering, fs::File, sync::atomic::Ordering as AtomicOrdering, time::Instant};

/// Table produced by a compaction
struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

/// Progress of a running compaction
struct CompactionState {
    compaction: Compaction,

    /// Sequence numbers < `smallest_snapshot` are not significant since we
    /// will never have to service a snapshot below `smallest_snapshot`.
    /// Therefore if we have seen a sequence number S <= `smallest_snapshot`,
    /// we can drop all entries for the same key with sequence numbers < S.
    smallest_snapshot: SeqNo,

    outputs: Vec<CompactionOutput>,

    /// State kept for the output being generated
    builder: Option<TableBuilder>,

    total_bytes: u64,
}

impl CompactionState {
    fn current_output(&mut self) -> Option<&mut CompactionOutput> {
        self.outputs.last_mut()
    }
}

impl DbInner {
    /// Merges the inputs of `compaction` into new tables of the next
    /// level and installs them.
    ///
    /// The lock is released while the merge runs.
    pub(super) fn do_compaction_work<'a>(
        &'a self,
        state: StateGuard<'a>,
        compaction: Compaction,
    ) -> (StateGuard<'a>, crate::Result<()>) {
        let start = Instant::now();
        let level = compaction.level();

        self.info_log.log(format_args!(
            "Compacting {}@{} + {}@{} files",
            compaction.num_input_files(0),
            level,
            compaction.num_input_files(1),
            level + 1,
        ));

        debug_assert!(state.versions.num_level_files(level) > 0);

        let smallest_snapshot = self
            .snapshots
            .oldest()
            .unwrap_or_else(|| state.versions.last_sequence());

        let mut input = state.versions.make_input_iterator(&compaction);

        let mut compact = CompactionState {
            compaction,
            smallest_snapshot,
            outputs: Vec::new(),
            builder: None,
            total_bytes: 0,
        };

        // Release mutex while we're actually doing the compaction work
        drop(state);

        let mut result = self.run_compaction(&mut compact, &mut *input);
        drop(input);

        let mut state = self.lock_state();

        let bytes_read = total_file_size(compact.compaction.inputs(0))
            + total_file_size(compact.compaction.inputs(1));

        let bytes_written = compact.outputs.iter().map(|out| out.file_size).sum();

        state.stats[level + 1].add(start.elapsed(), bytes_read, bytes_written);

        if result.is_ok() {
            result = Self::install_compaction_results(&mut state, &mut compact);
        }

        if let Err(e) = &result {
            self.record_background_error(&mut state, e.clone());
        }

        self.info_log.log(format_args!(
            "compacted to: {} {}",
            state.versions.level_summary(),
            status_string(&result),
        ));

        Self::cleanup_compaction(&mut state, compact);

        (state, result)
    }

    fn run_compaction(
        &self,
        compact: &mut CompactionState,
        input: &mut dyn InternalIterator,
    ) -> crate::Result<()> {
        let ucmp = self.icmp.user_comparator().clone();

        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        input.seek_to_first();

        while input.valid() && !self.is_shutting_down() {
            // Prioritize immutable compaction work
            if self.has_imm.load(AtomicOrdering::Acquire) {
                let state = self.lock_state();
                let state = self.compact_memtable(state);
                drop(state);

                // Wake up make_room_for_write if necessary
                self.background_work_finished.notify_all();
            }

            let key = input.key();

            if compact.compaction.should_stop_before(key) && compact.builder.is_some() {
                self.finish_compaction_output_file(compact, input)?;
            }

            // Handle key/value, add to state, etc.
            let mut drop_entry = false;

            match ParsedInternalKey::parse(key) {
                None => {
                    // Do not hide error keys
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Some(ikey) => {
                    let is_new_user_key = current_user_key
                        .as_deref()
                        .is_none_or(|current| ucmp.compare(ikey.user_key, current) != Ordering::Equal);

                    if is_new_user_key {
                        // First occurrence of this user key
                        current_user_key = Some(ikey.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= compact.smallest_snapshot {
                        // Hidden by a newer entry for same user key
                        drop_entry = true;
                    } else if ikey.value_type == ValueType::Deletion
                        && ikey.seqno <= compact.smallest_snapshot
                        && compact.compaction.is_base_level_for_key(ikey.user_key)
                    {
                        // For this user key:
                        // (1) there is no data in higher levels
                        // (2) data in lower levels will have larger sequence numbers
                        // (3) data in layers that are being compacted here and have
                        //     smaller sequence numbers will be dropped in the next
                        //     few iterations of this loop (by rule above).
                        // Therefore this deletion marker is obsolete and can be dropped.
                        drop_entry = true;
                    }

                    last_sequence_for_key = ikey.seqno;
                }
            }

            if !drop_entry {
                // Open output file if necessary
                if compact.builder.is_none() {
                    self.open_compaction_output_file(compact)?;
                }

                let key = input.key();

                if let Some(builder) = &mut compact.builder {
                    if builder.num_entries() == 0 {
                        if let Some(output) = compact.outputs.last_mut() {
                            output.smallest = InternalKey::decode_from(key);
                        }
                    }

                    builder.add(key, input.value())?;
                }

                if let Some(output) = compact.current_output() {
                    output.largest = InternalKey::decode_from(key);
                }

                // Close output file if it is big enough
                let output_full = compact.builder.as_ref().is_some_and(|builder| {
                    builder.file_size() >= compact.compaction.max_output_file_size()
                });

                if output_full {
                    self.finish_compaction_output_file(compact, input)?;
                }
            }

            input.next();
        }

        if self.is_shutting_down() {
            return Err(crate::Error::ShuttingDown);
        }

        if compact.builder.is_some() {
            self.finish_compaction_output_file(compact, input)?;
        }

        input.status()
    }

    fn open_compaction_output_file(&self, compact: &mut CompactionState) -> crate::Result<()> {
        debug_assert!(compact.builder.is_none());

        let number = {
            let mut state = self.lock_state();
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };

        compact.outputs.push(CompactionOutput {
            number,
            file_size: 0,
            smallest: InternalKey::default(),
            largest: InternalKey::default(),
        });

        // Make the output file
        let file = File::create(table_file_name(&self.folder, number))?;
        compact.builder = Some(TableBuilder::new(self.table_cache.options().clone(), file));

        Ok(())
    }

    fn finish_compaction_output_file(
        &self,
        compact: &mut CompactionState,
        input: &dyn InternalIterator,
    ) -> crate::Result<()> {
        let Some(mut builder) = compact.builder.take() else {
            return Ok(());
        };

        let Some(output) = compact.outputs.last_mut() else {
            builder.abandon();
            return Ok(());
        };

        let output_number = output.number;
        debug_assert_ne!(output_number, 0);

        // Check for iterator errors
        if let Err(e) = input.status() {
            builder.abandon();
            return Err(e);
        }

        let current_entries = builder.num_entries();
        let current_bytes = builder.finish()?;
        drop(builder);

        output.file_size = current_bytes;
        compact.total_bytes += current_bytes;

        if current_entries > 0 {
            // Verify that the table is usable
            let iter = self
                .table_cache
                .iter(&ReadOptions::default(), output_number, current_bytes);

            iter.status()?;

            self.info_log.log(format_args!(
                "Generated table #{output_number}@{}: {current_entries} keys, {current_bytes} bytes",
                compact.compaction.level(),
            ));
        }

        Ok(())
    }

    fn install_compaction_results(
        state: &mut DbState,
        compact: &mut CompactionState,
    ) -> crate::Result<()> {
        let level = compact.compaction.level();

        log::debug!(
            "Compacted {:?} => {} bytes",
            compact.compaction,
            compact.total_bytes,
        );

        // Add compaction outputs
        compact.compaction.add_input_deletions();

        for output in &compact.outputs {
            compact.compaction.edit.add_file(
                level + 1,
                output.number,
                output.file_size,
                output.smallest.clone(),
                output.largest.clone(),
            );
        }

        state.versions.log_and_apply(&mut compact.compaction.edit)
    }

    fn cleanup_compaction(state: &mut DbState, mut compact: CompactionState) {
        if let Some(mut builder) = compact.builder.take() {
            // May happen if we get a shutdown call in the middle of compaction
            builder.abandon();
        }

        for output in &compact.outputs {
            state.pending_outputs.remove(&output.number);
        }

        compact.compaction.release_inputs();
    }
}
