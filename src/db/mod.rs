// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The database handle
//!
//! All mutable state lives in [`DbState`] behind a single mutex. Slow work
//! (journal appends, table builds, compactions) runs with the mutex
//! released, and a single background thread performs memtable flushes
//! and compactions.

mod background;
mod compaction;
mod iter;
mod recovery;
mod repair;
mod write;

pub use iter::DbIterator;
pub use repair::repair_db;

use crate::{
    batch::WriteBatch,
    comparator::InternalKeyComparator,
    file::{log_file_name, parse_file_name, FileType, LOCK_FILE},
    info_log::InfoLog,
    iter::BoxedIterator,
    journal,
    locked_file::LockedFileGuard,
    memtable::{MemTable, MemTableGet},
    merge::merging_iterator,
    snapshot::{Snapshot, SnapshotList},
    stats::{format_stats, CompactionStats},
    table_cache::TableCache,
    value::{InternalKey, LookupKey, SeqNo, UserValue, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK},
    version::{
        edit::VersionEdit, set::VersionSet, GetStats, Version, VersionContext, NUM_LEVELS,
    },
    BlockCache, HashMap, HashSet, Options, Range, ReadOptions, WriteOptions,
};
use path_absolutize::Absolutize;
use std::{
    collections::VecDeque,
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::JoinHandle,
};

type StateGuard<'a> = MutexGuard<'a, DbState>;

/// Compaction of a key range requested by the user
struct ManualCompaction {
    id: u64,
    level: usize,
    done: bool,

    /// `None` means beginning of key range
    begin: Option<InternalKey>,

    /// `None` means end of key range
    end: Option<InternalKey>,
}

/// Write waiting in the writer queue
struct PendingWrite {
    id: u64,

    /// `None` forces a memtable switch without writing anything
    batch: Option<WriteBatch>,

    sync: bool,
}

/// State protected by the database mutex
pub(crate) struct DbState {
    mem: Arc<MemTable>,

    /// Memtable being flushed
    imm: Option<Arc<MemTable>>,

    logfile_number: u64,
    versions: VersionSet,

    /// Table files being written, protected from deletion
    pending_outputs: HashSet<u64>,

    /// Set when a background operation failed; all later writes fail
    bg_error: Option<Arc<crate::Error>>,

    background_compaction_scheduled: bool,
    manual_compaction: Option<ManualCompaction>,
    next_manual_id: u64,

    /// Queue of writers; the front one writes for a group of writers
    writers: VecDeque<PendingWrite>,

    /// Results of writes that were committed by another writer
    finished_writes: HashMap<u64, crate::Result<()>>,
    next_writer_id: u64,

    stats: [CompactionStats; NUM_LEVELS],
}

pub(crate) struct DbInner {
    folder: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    block_cache: Arc<BlockCache>,
    table_cache: Arc<TableCache>,
    version_ctx: Arc<VersionContext>,
    info_log: InfoLog,
    snapshots: Arc<SnapshotList>,

    state: Mutex<DbState>,

    /// Journal of the active memtable
    ///
    /// Only the writer at the front of the queue appends to it.
    log: Mutex<Option<journal::Writer>>,

    /// Signalled when writes of the queue complete
    writers_done: Condvar,

    background_work_scheduled: Condvar,
    background_work_finished: Condvar,

    shutting_down: AtomicBool,

    /// Mirrors `DbState::imm.is_some()` so compactions can check it cheaply
    has_imm: AtomicBool,

    #[allow(dead_code)]
    lock: LockedFileGuard,
}

impl DbInner {
    fn lock_state(&self) -> StateGuard<'_> {
        self.state.lock().expect("lock is poisoned")
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Returns a merged iterator over all internal keys, the version it
    /// reads and the latest sequence number.
    fn new_internal_iterator(&self, opts: &ReadOptions) -> (BoxedIterator, Arc<Version>, SeqNo) {
        let state = self.lock_state();
        let latest_snapshot = state.versions.last_sequence();

        // Collect together all needed child iterators
        let mut list: Vec<BoxedIterator> = vec![Box::new(state.mem.iter())];

        if let Some(imm) = &state.imm {
            list.push(Box::new(imm.iter()));
        }

        let version = state.versions.current();
        drop(state);

        version.add_iterators(opts, &mut list);

        let iter = merging_iterator(Arc::new(self.icmp.clone()), list);
        (iter, version, latest_snapshot)
    }

    /// Records a sample of bytes read at `internal_key`, scheduling a
    /// compaction if a file became too expensive to read through.
    pub(crate) fn record_read_sample(&self, version: &Version, internal_key: &[u8]) {
        if version.record_read_sample(internal_key) {
            let mut state = self.lock_state();
            self.maybe_schedule_compaction(&mut state);
        }
    }

    fn get(&self, opts: &ReadOptions, key: &[u8]) -> crate::Result<Option<UserValue>> {
        let state = self.lock_state();
        let snapshot = opts
            .snapshot
            .unwrap_or_else(|| state.versions.last_sequence());

        let mem = state.mem.clone();
        let imm = state.imm.clone();
        let current = state.versions.current();
        drop(state);

        let lkey = LookupKey::new(key, snapshot);

        // First look in the memtable, then in the immutable memtable (if any)
        match mem.get(&lkey) {
            MemTableGet::Found(value) => return Ok(Some(value)),
            MemTableGet::Deleted => return Ok(None),
            MemTableGet::NotFound => {}
        }

        if let Some(imm) = imm {
            match imm.get(&lkey) {
                MemTableGet::Found(value) => return Ok(Some(value)),
                MemTableGet::Deleted => return Ok(None),
                MemTableGet::NotFound => {}
            }
        }

        let mut stats = GetStats::default();
        let result = current.get(opts, &lkey, &mut stats);

        if current.update_stats(stats) {
            let mut state = self.lock_state();
            self.maybe_schedule_compaction(&mut state);
        }

        result
    }

    /// Forces the current memtable contents to be flushed and waits for
    /// the flush to finish.
    fn flush_memtable(&self) -> crate::Result<()> {
        // None batch means just wait for earlier writes to be done
        self.write(&WriteOptions::default(), None)?;

        // Wait until the compaction completes
        let mut state = self.lock_state();

        while state.imm.is_some() && state.bg_error.is_none() && !self.is_shutting_down() {
            state = self
                .background_work_finished
                .wait(state)
                .expect("lock is poisoned");
        }

        match &state.bg_error {
            Some(e) => Err(crate::Error::Background(e.clone())),
            None if state.imm.is_some() => Err(crate::Error::ShuttingDown),
            None => Ok(()),
        }
    }

    /// Compacts the files of `level` overlapping the user key range into
    /// `level + 1`, waiting for the compaction to finish.
    fn compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> crate::Result<()> {
        debug_assert!(level + 1 < NUM_LEVELS);

        let begin = begin.map(|key| InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
        let end = end.map(|key| InternalKey::new(key, 0, crate::value::ValueType::Deletion));

        let mut state = self.lock_state();

        let id = state.next_manual_id;
        state.next_manual_id += 1;

        let mut registered = false;

        loop {
            let is_mine = state
                .manual_compaction
                .as_ref()
                .is_some_and(|manual| manual.id == id);

            if registered && !is_mine {
                // Background thread finished our compaction
                break;
            }

            if self.is_shutting_down() || state.bg_error.is_some() {
                break;
            }

            if state.manual_compaction.is_none() {
                state.manual_compaction = Some(ManualCompaction {
                    id,
                    level,
                    done: false,
                    begin: begin.clone(),
                    end: end.clone(),
                });
                registered = true;

                self.maybe_schedule_compaction(&mut state);
            }

            state = self
                .background_work_finished
                .wait(state)
                .expect("lock is poisoned");
        }

        // Cancel my manual compaction since we aborted early
        if state
            .manual_compaction
            .as_ref()
            .is_some_and(|manual| manual.id == id)
        {
            state.manual_compaction = None;
        }

        match &state.bg_error {
            Some(e) => Err(crate::Error::Background(e.clone())),
            None if self.is_shutting_down() => Err(crate::Error::ShuttingDown),
            None => Ok(()),
        }
    }

    fn property(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix("leveldb.")?;

        let state = self.lock_state();
        let current = state.versions.current();

        if let Some(level) = rest.strip_prefix("num-files-at-level") {
            let level = level.parse::<usize>().ok()?;
            return (level < NUM_LEVELS).then(|| current.num_level_files(level).to_string());
        }

        match rest {
            "stats" => {
                let files = std::array::from_fn(|level| state.versions.num_level_files(level));
                let bytes = std::array::from_fn(|level| state.versions.num_level_bytes(level));
                Some(format_stats(&state.stats, &files, &bytes))
            }
            "sstables" => Some(current.debug_string()),
            "approximate-memory-usage" => {
                let mut total = self.block_cache.weight();
                total += state.mem.approximate_memory_usage() as u64;

                if let Some(imm) = &state.imm {
                    total += imm.approximate_memory_usage() as u64;
                }

                Some(total.to_string())
            }
            _ => None,
        }
    }
}

/// An embedded, persistent, ordered key-value store
///
/// The handle is thread-safe; share it between threads by wrapping it in
/// an [`Arc`]. Dropping the handle stops background work and releases the
/// directory lock (once all iterators are dropped as well).
///
/// ```
/// use levelkv::{Db, Options, ReadOptions, WriteOptions};
/// #
/// # let folder = tempfile::tempdir()?;
///
/// let db = Db::open(&folder, Options::default().create_if_missing(true))?;
///
/// db.put(&WriteOptions::default(), "a", "hello")?;
/// let value = db.get(&ReadOptions::default(), "a")?;
/// assert_eq!(Some(b"hello".as_slice()), value.as_deref());
///
/// db.delete(&WriteOptions::default(), "a")?;
/// assert!(db.get(&ReadOptions::default(), "a")?.is_none());
/// #
/// # Ok::<_, levelkv::Error>(())
/// ```
pub struct Db {
    inner: Arc<DbInner>,
    background: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Db({})", self.inner.folder.display())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Error while closing database: {e:?}");
        }
    }
}

impl Db {
    /// Opens the database stored in the given directory.
    ///
    /// Any data that was written to the journal but not yet to a table
    /// file is recovered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Locked`](crate::Error::Locked) if another handle
    /// holds the database, an invalid argument error if the database is
    /// missing (or exists, depending on the options), or the error that
    /// made recovery fail.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> crate::Result<Self> {
        let folder = path.as_ref().absolutize()?.into_owned();
        let options = Arc::new(options.sanitized());

        log::info!("Opening database at {}", folder.display());

        if options.create_if_missing {
            std::fs::create_dir_all(&folder)?;
        } else if !folder.try_exists()? {
            return Err(crate::Error::InvalidArgument(format!(
                "{}: does not exist (create_if_missing is false)",
                folder.display()
            )));
        }

        let lock = LockedFileGuard::acquire(&folder.join(LOCK_FILE))?;
        let info_log = InfoLog::open(&folder);
        info_log.log(format_args!("{options:?}"));

        let block_cache = options.block_cache.clone().unwrap_or_else(|| {
            Arc::new(BlockCache::with_capacity_bytes(options.block_cache_capacity))
        });

        let table_cache = Arc::new(TableCache::new(
            &folder,
            options.table_options(block_cache.clone()),
            options.max_open_files,
        ));

        let version_ctx = Arc::new(VersionContext::new(options.clone(), table_cache.clone()));
        let icmp = version_ctx.icmp.clone();

        let state = DbState {
            mem: Arc::new(MemTable::new(icmp.clone())),
            imm: None,
            logfile_number: 0,
            versions: VersionSet::new(&folder, version_ctx.clone()),
            pending_outputs: HashSet::default(),
            bg_error: None,
            background_compaction_scheduled: false,
            manual_compaction: None,
            next_manual_id: 0,
            writers: VecDeque::new(),
            finished_writes: HashMap::default(),
            next_writer_id: 0,
            stats: [CompactionStats::default(); NUM_LEVELS],
        };

        let inner = Arc::new(DbInner {
            folder,
            options,
            icmp,
            block_cache,
            table_cache,
            version_ctx,
            info_log,
            snapshots: Arc::default(),
            state: Mutex::new(state),
            log: Mutex::new(None),
            writers_done: Condvar::new(),
            background_work_scheduled: Condvar::new(),
            background_work_finished: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            lock,
        });

        {
            let mut state = inner.lock_state();
            let mut edit = VersionEdit::default();

            // Recover handles create_if_missing, error_if_exists
            let save_manifest = inner.recover(&mut state, &mut edit)?;

            let mut log = inner.log.lock().expect("lock is poisoned");

            if log.is_none() {
                let new_log_number = state.versions.new_file_number();
                let file = File::create(log_file_name(&inner.folder, new_log_number))?;

                edit.set_log_number(new_log_number);
                *log = Some(journal::Writer::new(file));
                state.logfile_number = new_log_number;
            }

            drop(log);

            if save_manifest {
                // No older logs needed after recovery
                edit.set_prev_log_number(0);
                edit.set_log_number(state.logfile_number);
                state.versions.log_and_apply(&mut edit)?;
            }

            let mut state = inner.remove_obsolete_files(state);
            inner.maybe_schedule_compaction(&mut state);
        }

        let background = {
            let inner = inner.clone();

            std::thread::Builder::new()
                .name("levelkv-bg".into())
                .spawn(move || inner.background_thread())?
        };

        log::info!("Opened database at {}", inner.folder.display());

        Ok(Self {
            inner,
            background: Some(background),
        })
    }

    /// Path of the database directory
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.folder
    }

    /// Sets `key` to `value`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the journal could not be written, or a
    /// background error occurred before.
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        opts: &WriteOptions,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(opts, batch)
    }

    /// Removes `key`. It is not an error if `key` does not exist.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the journal could not be written, or a
    /// background error occurred before.
    pub fn delete<K: AsRef<[u8]>>(&self, opts: &WriteOptions, key: K) -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(opts, batch)
    }

    /// Applies all updates of `batch` atomically.
    ///
    /// Concurrent writers are grouped so that one journal append (and
    /// sync) covers several batches.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the journal could not be written, or a
    /// background error occurred before.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> crate::Result<()> {
        self.inner.write(opts, Some(batch))
    }

    /// Returns the value of `key`, or `None` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or a table is corrupted.
    pub fn get<K: AsRef<[u8]>>(
        &self,
        opts: &ReadOptions,
        key: K,
    ) -> crate::Result<Option<UserValue>> {
        self.inner.get(opts, key.as_ref())
    }

    /// Returns an iterator over the database contents.
    ///
    /// The iterator is initially invalid; position it with one of the
    /// seek methods. It reads the state as of its creation (or of the
    /// snapshot given in `opts`).
    #[must_use]
    pub fn iter(&self, opts: &ReadOptions) -> DbIterator {
        let (iter, version, latest_snapshot) = self.inner.new_internal_iterator(opts);
        let sequence = opts.snapshot.unwrap_or(latest_snapshot);

        DbIterator::new(self.inner.clone(), version, iter, sequence)
    }

    /// Returns a handle to the current database state.
    ///
    /// Reads through [`ReadOptions::snapshot`] see the state as of now.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.lock_state();
        Snapshot::new(self.inner.snapshots.clone(), state.versions.last_sequence())
    }

    /// Releases a snapshot, same as dropping it.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Returns the approximate file system space used by the keys of
    /// each range.
    ///
    /// Data still in the memtable is not counted.
    #[must_use]
    pub fn approximate_sizes(&self, ranges: &[Range]) -> Vec<u64> {
        let state = self.inner.lock_state();
        let versions = &state.versions;
        let version = versions.current();

        ranges
            .iter()
            .map(|range| {
                // Convert user keys into corresponding internal keys
                let start = InternalKey::new(&range.start, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let limit = InternalKey::new(&range.limit, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);

                let start = versions.approximate_offset_of(&version, &start);
                let limit = versions.approximate_offset_of(&version, &limit);

                limit.saturating_sub(start)
            })
            .collect()
    }

    /// Compacts the underlying storage for the key range `[begin, end]`.
    ///
    /// Deleted and overwritten versions are discarded, and the data is
    /// rearranged to reduce the cost of operations needed to access it.
    /// `None` is treated as a key before (or after) all keys.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a background error occurs.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> crate::Result<()> {
        let max_level_with_files = {
            let version = self.inner.lock_state().versions.current();

            (1..NUM_LEVELS)
                .filter(|&level| version.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };

        self.inner.flush_memtable()?;

        for level in 0..max_level_with_files {
            self.inner.compact_level(level, begin, end)?;
        }

        Ok(())
    }

    /// Returns the value of a database property, or `None` if the
    /// property is unknown.
    ///
    /// - `leveldb.num-files-at-level<N>`: number of files at level N
    /// - `leveldb.stats`: multi-line compaction statistics
    /// - `leveldb.sstables`: multi-line listing of all table files
    /// - `leveldb.approximate-memory-usage`: bytes used by memtables and the block cache
    #[must_use]
    pub fn property(&self, name: &str) -> Option<String> {
        self.inner.property(name)
    }

    /// Flushes the memtable to a table file and waits for it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the flush fails.
    #[doc(hidden)]
    pub fn compact_memtable(&self) -> crate::Result<()> {
        self.inner.flush_memtable()
    }

    /// Compacts the files of `level` overlapping the given range.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a background error occurs.
    #[doc(hidden)]
    pub fn compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> crate::Result<()> {
        self.inner.compact_level(level, begin, end)
    }

    /// Returns the largest number of bytes any file at level 1 or deeper
    /// overlaps in the next level.
    #[doc(hidden)]
    #[must_use]
    pub fn max_next_level_overlapping_bytes(&self) -> u64 {
        self.inner
            .lock_state()
            .versions
            .max_next_level_overlapping_bytes()
    }

    /// Blocks until no background work is scheduled.
    ///
    /// # Errors
    ///
    /// Returns the background error, if any.
    #[doc(hidden)]
    pub fn wait_for_background_work(&self) -> crate::Result<()> {
        let mut state = self.inner.lock_state();

        while state.background_compaction_scheduled
            && state.bg_error.is_none()
            && !self.inner.is_shutting_down()
        {
            state = self
                .inner
                .background_work_finished
                .wait(state)
                .expect("lock is poisoned");
        }

        match &state.bg_error {
            Some(e) => Err(crate::Error::Background(e.clone())),
            None => Ok(()),
        }
    }

    /// Closes the database, stopping background work.
    ///
    /// Dropping the handle does the same, but swallows errors.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the final flush fails.
    pub fn close(mut self) -> crate::Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> crate::Result<()> {
        let Some(background) = self.background.take() else {
            return Ok(());
        };

        log::debug!("Closing database at {}", self.inner.folder.display());

        let mut result = Ok(());

        if self.inner.options.flush_on_close {
            let is_empty = self.inner.lock_state().mem.is_empty();

            if !is_empty {
                result = self.inner.flush_memtable();
            }
        }

        self.inner.shutting_down.store(true, Ordering::Release);

        {
            // NOTE: Notify while holding the mutex, so no waiter misses the signal
            let _state = self.inner.lock_state();
            self.inner.background_work_scheduled.notify_all();
            self.inner.background_work_finished.notify_all();
            self.inner.writers_done.notify_all();
        }

        if background.join().is_err() {
            log::error!("Background thread panicked");
        }

        if let Some(log) = self.inner.log.lock().expect("lock is poisoned").as_mut() {
            result = result.and(log.flush());
        }

        log::info!("Closed database at {}", self.inner.folder.display());

        result
    }
}

/// Deletes the contents of a database directory.
///
/// Only files that belong to a database are removed, then the directory
/// itself if it became empty. A missing directory is not an error.
///
/// # Errors
///
/// Returns [`Error::Locked`](crate::Error::Locked) if the database is
/// open, or the first error hit while deleting files.
pub fn destroy_db<P: AsRef<Path>>(path: P, _options: &Options) -> crate::Result<()> {
    let folder = path.as_ref();

    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,

        // Ignore error in case directory does not exist
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),

        Err(e) => return Err(e.into()),
    };

    log::info!("Destroying database at {}", folder.display());

    let lock_path = folder.join(LOCK_FILE);
    let lock = LockedFileGuard::acquire(&lock_path)?;

    let mut result = Ok(());

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();

        let Some((_, file_type)) = name.to_str().and_then(parse_file_name) else {
            continue;
        };

        if file_type == FileType::DbLock {
            continue;
        }

        if let Err(e) = std::fs::remove_file(entry.path()) {
            log::warn!("Could not delete {}: {e:?}", entry.path().display());

            if result.is_ok() {
                result = Err(e.into());
            }
        }
    }

    drop(lock);

    // Ignore errors, the directory may still contain other files
    std::fs::remove_file(&lock_path).ok();
    std::fs::remove_dir(folder).ok();

    result
}
