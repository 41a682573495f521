// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Rebuilds the manifest of a damaged database
//!
//! Every journal is converted to a table, every table is scanned for its
//! key range and largest sequence number, and a new manifest listing all
//! tables at level 0 is written. Files that cannot be used are moved into
//! the `lost` folder instead of being deleted.

use super::background::status_string;
use crate::{
    batch::WriteBatch,
    comparator::InternalKeyComparator,
    file::{
        descriptor_file_name, log_file_name, parse_file_name, set_current_file,
        sst_table_file_name, table_file_name, temp_file_name, FileType, LOCK_FILE, LOST_FOLDER,
    },
    flush::build_table,
    info_log::InfoLog,
    journal::{self, reader::Reporter},
    locked_file::LockedFileGuard,
    memtable::MemTable,
    table::TableBuilder,
    table_cache::TableCache,
    value::{InternalKey, ParsedInternalKey, SeqNo},
    version::{edit::VersionEdit, meta::FileMetaData},
    BlockCache, Options, ReadOptions,
};
use path_absolutize::Absolutize;
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Table found during repair, with the largest sequence number it holds
struct TableInfo {
    meta: FileMetaData,
    max_sequence: SeqNo,
}

/// Logs journal corruption; repair never fails because of it
struct RepairReporter<'a> {
    info_log: &'a InfoLog,
    log_number: u64,
}

impl Reporter for RepairReporter<'_> {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        // We print error messages for corruption, but continue repairing
        self.info_log.log(format_args!(
            "Log #{}: dropping {bytes} bytes; {reason}",
            self.log_number
        ));
    }
}

struct Repairer {
    folder: PathBuf,
    options: Arc<Options>,
    table_cache: TableCache,
    info_log: InfoLog,

    manifests: Vec<String>,
    table_numbers: Vec<u64>,
    logs: Vec<u64>,
    tables: Vec<TableInfo>,
    next_file_number: u64,
}

impl Repairer {
    fn new(folder: PathBuf, options: &Options) -> Self {
        let options = Arc::new(options.clone().sanitized());

        let block_cache = options.block_cache.clone().unwrap_or_else(|| {
            Arc::new(BlockCache::with_capacity_bytes(options.block_cache_capacity))
        });

        // Only a handful of tables are needed at once
        let table_cache = TableCache::new(&folder, options.table_options(block_cache), 20);
        let info_log = InfoLog::open(&folder);

        Self {
            folder,
            options,
            table_cache,
            info_log,
            manifests: Vec::new(),
            table_numbers: Vec::new(),
            logs: Vec::new(),
            tables: Vec::new(),
            next_file_number: 1,
        }
    }

    fn run(&mut self) -> crate::Result<()> {
        self.find_files()?;
        self.convert_log_files_to_tables();
        self.extract_meta_data();
        self.write_descriptor()?;

        let bytes = self.tables.iter().map(|t| t.meta.file_size).sum::<u64>();

        self.info_log.log(format_args!(
            "**** Repaired database {}; recovered {} files; {bytes} bytes. Some data may have been lost. ****",
            self.folder.display(),
            self.tables.len(),
        ));

        Ok(())
    }

    fn find_files(&mut self) -> crate::Result<()> {
        let mut found_any = false;

        for entry in std::fs::read_dir(&self.folder)? {
            let entry = entry?;
            let name = entry.file_name();

            let Some(name) = name.to_str() else {
                continue;
            };

            let Some((number, file_type)) = parse_file_name(name) else {
                continue;
            };

            if matches!(file_type, FileType::DbLock | FileType::InfoLog) {
                continue;
            }

            found_any = true;

            if file_type == FileType::Descriptor {
                self.manifests.push(name.to_owned());
                continue;
            }

            if number + 1 > self.next_file_number {
                self.next_file_number = number + 1;
            }

            match file_type {
                FileType::Log => self.logs.push(number),
                FileType::Table => self.table_numbers.push(number),
                _ => {
                    // Ignore other files
                }
            }
        }

        if !found_any {
            return Err(crate::Error::NotFound(format!(
                "{}: repair found no files",
                self.folder.display()
            )));
        }

        self.logs.sort_unstable();
        self.table_numbers.sort_unstable();

        Ok(())
    }

    fn convert_log_files_to_tables(&mut self) {
        for log_number in std::mem::take(&mut self.logs) {
            let path = log_file_name(&self.folder, log_number);

            if let Err(e) = self.convert_log_to_table(log_number) {
                self.info_log
                    .log(format_args!("Log #{log_number}: ignoring conversion error: {e}"));
            }

            self.archive_file(&path);
        }
    }

    fn convert_log_to_table(&mut self, log_number: u64) -> crate::Result<()> {
        let file = File::open(log_file_name(&self.folder, log_number))?;

        let mut reporter = RepairReporter {
            info_log: &self.info_log,
            log_number,
        };

        // We intentionally make the reader do checksumming so that
        // corruptions cause entire commits to be skipped instead of
        // propagating bad information (like overly large sequence
        // numbers).
        let mut reader = journal::Reader::new(file, Some(&mut reporter), true, 0);

        // Read all the records and add to a memtable
        let icmp = InternalKeyComparator::new(self.options.comparator.clone());
        let mem = Arc::new(MemTable::new(icmp));

        let mut batch = WriteBatch::new();
        let mut counter = 0;

        while let Some(record) = reader.read_record() {
            if let Err(e) = batch.set_contents(&record) {
                self.info_log
                    .log(format_args!("Log #{log_number}: dropping {} bytes; {e}", record.len()));
                continue;
            }

            match batch.insert_into(&mem) {
                Ok(()) => counter += batch.count(),
                Err(e) => {
                    self.info_log
                        .log(format_args!("Log #{log_number}: ignoring {e}"));
                }
            }
        }

        drop(reader);

        // Do not record a version edit for this conversion to a table
        // since extract_meta_data() will also generate edits.
        let number = self.next_file_number;
        self.next_file_number += 1;

        let meta = build_table(&self.folder, &self.table_cache, &mut mem.iter(), number)?;

        if meta.is_some() {
            self.table_numbers.push(number);
        }

        self.info_log.log(format_args!(
            "Log #{log_number}: {counter} ops saved to Table #{number} OK"
        ));

        Ok(())
    }

    fn extract_meta_data(&mut self) {
        for number in std::mem::take(&mut self.table_numbers) {
            self.scan_table(number);
        }
    }

    fn table_size(&self, number: u64) -> Option<(PathBuf, u64)> {
        [
            table_file_name(&self.folder, number),
            sst_table_file_name(&self.folder, number),
        ]
        .into_iter()
        .find_map(|path| {
            let size = std::fs::metadata(&path).ok()?.len();
            Some((path, size))
        })
    }

    fn scan_table(&mut self, number: u64) {
        let Some((path, file_size)) = self.table_size(number) else {
            let path = table_file_name(&self.folder, number);
            self.info_log
                .log(format_args!("Table #{number}: dropped: file not found"));
            self.archive_file(&path);
            return;
        };

        // Extract metadata by scanning through table
        let opts = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut iter = self.table_cache.iter(&opts, number, file_size);

        let mut counter = 0;
        let mut smallest: Option<InternalKey> = None;
        let mut largest = InternalKey::default();
        let mut max_sequence = 0;

        iter.seek_to_first();

        while iter.valid() {
            let key = iter.key();

            let Some(parsed) = ParsedInternalKey::parse(key) else {
                self.info_log.log(format_args!(
                    "Table #{number}: unparsable key {key:?}"
                ));
                iter.next();
                continue;
            };

            counter += 1;

            if smallest.is_none() {
                smallest = Some(InternalKey::decode_from(key));
            }

            largest = InternalKey::decode_from(key);
            max_sequence = max_sequence.max(parsed.seqno);

            iter.next();
        }

        let status = iter.status();
        drop(iter);

        self.info_log.log(format_args!(
            "Table #{number}: {counter} entries {}",
            status_string(&status),
        ));

        let Some(smallest) = smallest else {
            // Nothing readable in this table
            self.table_cache.evict(number);
            self.archive_file(&path);
            return;
        };

        let table = TableInfo {
            meta: FileMetaData::new(number, file_size, smallest, largest),
            max_sequence,
        };

        if status.is_ok() {
            self.tables.push(table);
        } else {
            self.repair_table(&path, table);
        }
    }

    /// Copies the readable prefix of a damaged table into a new table,
    /// which then replaces the damaged one.
    fn repair_table(&mut self, path: &Path, mut table: TableInfo) {
        let copy_number = self.next_file_number;
        self.next_file_number += 1;

        let copy = table_file_name(&self.folder, copy_number);

        match self.copy_table(table.meta.number, table.meta.file_size, &copy) {
            Ok((counter, file_size)) if counter > 0 => {
                self.table_cache.evict(table.meta.number);

                let result = std::fs::remove_file(path)
                    .and_then(|()| std::fs::rename(&copy, table_file_name(&self.folder, table.meta.number)));

                match result {
                    Ok(()) => {
                        self.info_log.log(format_args!(
                            "Table #{}: {counter} entries repaired",
                            table.meta.number
                        ));

                        table.meta.file_size = file_size;
                        self.tables.push(table);
                    }
                    Err(e) => {
                        self.info_log.log(format_args!(
                            "Table #{}: could not replace damaged table: {e}",
                            table.meta.number
                        ));
                        std::fs::remove_file(&copy).ok();
                    }
                }
            }
            Ok(_) => {
                std::fs::remove_file(&copy).ok();
            }
            Err(e) => {
                self.info_log.log(format_args!(
                    "Table #{}: could not be repaired: {e}",
                    table.meta.number
                ));
                std::fs::remove_file(&copy).ok();
            }
        }
    }

    fn copy_table(&self, number: u64, file_size: u64, copy: &Path) -> crate::Result<(u64, u64)> {
        let opts = ReadOptions {
            verify_checksums: false,
            fill_cache: false,
            snapshot: None,
        };

        let mut builder = TableBuilder::new(self.table_cache.options().clone(), File::create(copy)?);
        let mut iter = self.table_cache.iter(&opts, number, file_size);
        let mut counter = 0;

        iter.seek_to_first();

        while iter.valid() {
            builder.add(iter.key(), iter.value())?;
            counter += 1;
            iter.next();
        }

        let file_size = builder.finish()?;

        Ok((counter, file_size))
    }

    fn write_descriptor(&mut self) -> crate::Result<()> {
        let tmp = temp_file_name(&self.folder, 1);

        let max_sequence = self
            .tables
            .iter()
            .map(|t| t.max_sequence)
            .max()
            .unwrap_or_default();

        let mut edit = VersionEdit::default();
        edit.set_comparator_name(self.options.comparator.name());
        edit.set_log_number(0);
        edit.set_next_file(self.next_file_number);
        edit.set_last_sequence(max_sequence);

        // TODO: spread the recovered tables over multiple levels instead of putting them all into level 0
        for t in &self.tables {
            edit.add_file(
                0,
                t.meta.number,
                t.meta.file_size,
                t.meta.smallest.clone(),
                t.meta.largest.clone(),
            );
        }

        let result = File::create(&tmp).map_err(crate::Error::from).and_then(|file| {
            let mut writer = journal::Writer::new(file);
            writer.add_record(&edit.encode())?;
            writer.sync()
        });

        if let Err(e) = result {
            std::fs::remove_file(&tmp).ok();
            return Err(e);
        }

        // Discard older manifests
        for manifest in std::mem::take(&mut self.manifests) {
            self.archive_file(&self.folder.join(manifest));
        }

        // Install new manifest
        std::fs::rename(&tmp, descriptor_file_name(&self.folder, 1))?;
        set_current_file(&self.folder, 1)?;

        Ok(())
    }

    /// Moves a file into the `lost` folder, e.g. `db/foo` to `db/lost/foo`.
    fn archive_file(&self, path: &Path) {
        let lost = self.folder.join(LOST_FOLDER);

        // Ignore error, the folder may already exist
        std::fs::create_dir(&lost).ok();

        let Some(name) = path.file_name() else {
            return;
        };

        let result = std::fs::rename(path, lost.join(name));

        self.info_log.log(format_args!(
            "Archiving {}: {}",
            path.display(),
            status_string(&result.map_err(Into::into)),
        ));
    }
}

/// Tries to recover as much data as possible from a damaged database.
///
/// Some data may be lost, so be careful when calling this function on a
/// database that contains important information.
///
/// # Errors
///
/// Returns [`Error::Locked`](crate::Error::Locked) if the database is
/// open, or an error if the directory holds no database files or the new
/// manifest cannot be written.
pub fn repair_db<P: AsRef<Path>>(path: P, options: &Options) -> crate::Result<()> {
    let folder = path.as_ref().absolutize()?.into_owned();

    log::info!("Repairing database at {}", folder.display());

    let _lock = LockedFileGuard::acquire(&folder.join(LOCK_FILE))?;

    Repairer::new(folder, options).run()
}
