// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bloom::{FilterPolicy, InternalFilterPolicy},
    comparator::{BytewiseComparator, Comparator, InternalKeyComparator},
    snapshot::Snapshot,
    table::TableOptions,
    value::SeqNo,
    BlockCache,
};
use std::sync::Arc;

/// Block compression
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    None,

    /// LZ4 compression
    ///
    /// Recommended for use cases with a focus
    /// on speed over compression ratio.
    #[cfg(feature = "lz4")]
    Lz4,
}

impl CompressionType {
    /// Block trailer tag
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::None => 0,

            #[cfg(feature = "lz4")]
            Self::Lz4 => 4,
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "lz4")]
        let c = Self::Lz4;

        #[cfg(not(feature = "lz4"))]
        let c = Self::None;

        c
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "no compression"),

            #[cfg(feature = "lz4")]
            Self::Lz4 => write!(f, "lz4"),
        }
    }
}

/// Database configuration
#[derive(Clone)]
pub struct Options {
    /// Create the database if it is missing
    pub(crate) create_if_missing: bool,

    /// Fail if the database already exists
    pub(crate) error_if_exists: bool,

    /// Abort on any detected corruption instead of skipping it
    pub(crate) paranoid_checks: bool,

    /// Memtable size at which it is frozen and flushed
    pub(crate) write_buffer_size: usize,

    /// Maximum number of open files (tables are cached up to this count minus 10)
    pub(crate) max_open_files: usize,

    /// Explicit block cache, shared between databases
    pub(crate) block_cache: Option<Arc<BlockCache>>,

    /// Capacity of the block cache created when none is given
    pub(crate) block_cache_capacity: u64,

    /// Approximate uncompressed size of data blocks
    pub(crate) block_size: usize,

    /// Entries between restart points of data blocks
    pub(crate) block_restart_interval: usize,

    /// Compression used for new blocks
    pub(crate) compression: CompressionType,

    /// Filter policy for new tables
    pub(crate) filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// User key ordering
    pub(crate) comparator: Arc<dyn Comparator>,

    /// Target size of table files produced by compactions
    pub(crate) max_file_size: u64,

    /// Bytes of file data per allowed seek before a file is scheduled for compaction
    pub(crate) allowed_seeks_divisor: u64,

    /// Maximum grandparent overlap of a compaction output, in multiples of `max_file_size`
    pub(crate) grandparent_overlap_factor: u64,

    /// Level-0 file count that triggers a compaction
    pub(crate) level0_compaction_trigger: usize,

    /// Level-0 file count at which writes are delayed
    pub(crate) level0_slowdown_writes_trigger: usize,

    /// Level-0 file count at which writes wait for background work
    pub(crate) level0_stop_writes_trigger: usize,

    /// Keep appending to the recovered journal and manifest
    pub(crate) reuse_logs: bool,

    /// Flush the memtable to a table when the database is closed
    pub(crate) flush_on_close: bool,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_open_files", &self.max_open_files)
            .field("block_cache_capacity", &self.block_cache_capacity)
            .field("block_size", &self.block_size)
            .field("block_restart_interval", &self.block_restart_interval)
            .field("compression", &self.compression)
            .field(
                "filter_policy",
                &self.filter_policy.as_ref().map(|p| p.name().to_owned()),
            )
            .field("comparator", &self.comparator.name())
            .field("max_file_size", &self.max_file_size)
            .field("allowed_seeks_divisor", &self.allowed_seeks_divisor)
            .field("grandparent_overlap_factor", &self.grandparent_overlap_factor)
            .field("level0_compaction_trigger", &self.level0_compaction_trigger)
            .field("level0_slowdown_writes_trigger", &self.level0_slowdown_writes_trigger)
            .field("level0_stop_writes_trigger", &self.level0_stop_writes_trigger)
            .field("reuse_logs", &self.reuse_logs)
            .finish_non_exhaustive()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: /* 4 MiB */ 4 * 1_024 * 1_024,
            max_open_files: 1_000,
            block_cache: None,
            block_cache_capacity: /* 8 MiB */ 8 * 1_024 * 1_024,
            block_size: /* 4 KiB */ 4 * 1_024,
            block_restart_interval: 16,
            compression: CompressionType::default(),
            filter_policy: None,
            comparator: Arc::new(BytewiseComparator),
            max_file_size: /* 2 MiB */ 2 * 1_024 * 1_024,
            allowed_seeks_divisor: /* 16 KiB */ 16 * 1_024,
            grandparent_overlap_factor: 10,
            level0_compaction_trigger: 4,
            level0_slowdown_writes_trigger: 8,
            level0_stop_writes_trigger: 12,
            reuse_logs: false,
            flush_on_close: false,
        }
    }
}

impl Options {
    /// Creates the database directory and an empty database if missing.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn create_if_missing(mut self, flag: bool) -> Self {
        self.create_if_missing = flag;
        self
    }

    /// Makes opening fail if the database already exists.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn error_if_exists(mut self, flag: bool) -> Self {
        self.error_if_exists = flag;
        self
    }

    /// Aborts recovery and reads on any detected corruption.
    ///
    /// If `false`, corrupted journal records are skipped and logged.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn paranoid_checks(mut self, flag: bool) -> Self {
        self.paranoid_checks = flag;
        self
    }

    /// Sets the amount of data to build up in memory before it is
    /// converted to a sorted table on disk.
    ///
    /// Clamped to [64 KiB, 1 GiB] when the database is opened.
    ///
    /// Defaults to 4 MiB.
    #[must_use]
    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Sets the number of open files the database may use.
    ///
    /// Clamped to [74, 50000] when the database is opened.
    ///
    /// Defaults to 1000.
    #[must_use]
    pub fn max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }

    /// Sets the block cache.
    ///
    /// You can create a global [`BlockCache`] and share it between multiple
    /// databases to cap global cache memory usage.
    #[must_use]
    pub fn block_cache(mut self, block_cache: Arc<BlockCache>) -> Self {
        self.block_cache = Some(block_cache);
        self
    }

    /// Sets the capacity of the block cache in bytes, if no block cache
    /// was given explicitly.
    ///
    /// Defaults to 8 MiB.
    #[must_use]
    pub fn block_cache_capacity(mut self, bytes: u64) -> Self {
        self.block_cache_capacity = bytes;
        self
    }

    /// Sets the approximate size of user data packed per block.
    ///
    /// Clamped to [1 KiB, 4 MiB] when the database is opened.
    ///
    /// Defaults to 4 KiB.
    #[must_use]
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the number of keys between restart points for delta encoding of keys.
    ///
    /// Defaults to 16.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn block_restart_interval(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.block_restart_interval = n;
        self
    }

    /// Sets the compression method.
    ///
    /// Using no compression may be faster for already compressed data.
    ///
    /// Default = LZ4 (if the `lz4` feature is enabled)
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the filter policy used to reduce disk reads for point lookups.
    ///
    /// Defaults to no filter.
    #[must_use]
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Sets the key ordering.
    ///
    /// The comparator's name must stay the same for the lifetime of the
    /// database.
    ///
    /// Defaults to lexicographic byte-wise ordering.
    #[must_use]
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Sets the target size of table files written by compactions.
    ///
    /// Clamped to [1 MiB, 1 GiB] when the database is opened.
    ///
    /// Defaults to 2 MiB.
    #[must_use]
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Sets how many bytes of a file one wasted seek is worth.
    ///
    /// A file gets `max(100, file_size / divisor)` seeks before it is
    /// scheduled for compaction.
    ///
    /// Defaults to 16 KiB.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is 0.
    #[must_use]
    pub fn allowed_seeks_divisor(mut self, bytes: u64) -> Self {
        assert!(bytes > 0);

        self.allowed_seeks_divisor = bytes;
        self
    }

    /// Sets how many times `max_file_size` a single compaction output may
    /// overlap in the grandparent level before a new output file is started.
    ///
    /// Defaults to 10.
    ///
    /// # Panics
    ///
    /// Panics if `factor` is 0.
    #[must_use]
    pub fn grandparent_overlap_factor(mut self, factor: u64) -> Self {
        assert!(factor > 0);

        self.grandparent_overlap_factor = factor;
        self
    }

    /// Sets the level-0 file count thresholds for compaction, write
    /// slowdown and write stop.
    ///
    /// Defaults to 4, 8 and 12.
    ///
    /// # Panics
    ///
    /// Panics if the thresholds are not strictly increasing or `compaction` is 0.
    #[must_use]
    pub fn level0_triggers(mut self, compaction: usize, slowdown: usize, stop: usize) -> Self {
        assert!(compaction > 0);
        assert!(compaction < slowdown);
        assert!(slowdown < stop);

        self.level0_compaction_trigger = compaction;
        self.level0_slowdown_writes_trigger = slowdown;
        self.level0_stop_writes_trigger = stop;
        self
    }

    /// Appends to the existing journal and manifest on open instead of
    /// starting new ones, when possible.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn reuse_logs(mut self, flag: bool) -> Self {
        self.reuse_logs = flag;
        self
    }

    /// Flushes the active memtable into a table when the database is closed,
    /// so the next open does not need to replay the journal.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn flush_on_close(mut self, flag: bool) -> Self {
        self.flush_on_close = flag;
        self
    }

    /// Clamps numeric options into their supported ranges.
    pub(crate) fn sanitized(mut self) -> Self {
        self.max_open_files = self.max_open_files.clamp(64 + 10, 50_000);
        self.write_buffer_size = self.write_buffer_size.clamp(64 << 10, 1 << 30);
        self.max_file_size = self.max_file_size.clamp(1 << 20, 1 << 30);
        self.block_size = self.block_size.clamp(1 << 10, 4 << 20);
        self
    }

    /// Maximum bytes a compaction output may overlap in the grandparent level
    pub(crate) fn max_grandparent_overlap_bytes(&self) -> u64 {
        self.grandparent_overlap_factor * self.max_file_size
    }

    /// Maximum bytes of inputs of an expanded compaction
    pub(crate) fn expanded_compaction_byte_size_limit(&self) -> u64 {
        25 * self.max_file_size
    }

    /// Settings of the tables of a database
    ///
    /// Tables store internal keys, so the user comparator and filter
    /// policy are wrapped to look at the user key part only.
    pub(crate) fn table_options(&self, block_cache: Arc<BlockCache>) -> TableOptions {
        let filter_policy = self.filter_policy.clone().map(|policy| {
            Arc::new(InternalFilterPolicy::new(policy)) as Arc<dyn FilterPolicy>
        });

        TableOptions {
            comparator: Arc::new(InternalKeyComparator::new(self.comparator.clone())),
            filter_policy,
            block_size: self.block_size,
            block_restart_interval: self.block_restart_interval,
            compression: self.compression,
            paranoid_checks: self.paranoid_checks,
            block_cache,
        }
    }
}

/// Options for write operations
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Sync the journal before the write is acknowledged
    ///
    /// Without it a machine crash may lose recent writes. A process
    /// crash never does.
    pub sync: bool,
}

impl WriteOptions {
    /// Sets the sync flag.
    #[must_use]
    pub fn sync(mut self, flag: bool) -> Self {
        self.sync = flag;
        self
    }
}

/// Options for read operations
#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    /// Verify block checksums of all data read from disk
    pub verify_checksums: bool,

    /// Add blocks read by this operation to the block cache
    pub fill_cache: bool,

    /// Read as of this sequence number instead of the latest state
    pub(crate) snapshot: Option<SeqNo>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

impl ReadOptions {
    /// Sets the checksum verification flag.
    #[must_use]
    pub fn verify_checksums(mut self, flag: bool) -> Self {
        self.verify_checksums = flag;
        self
    }

    /// Sets the fill cache flag.
    #[must_use]
    pub fn fill_cache(mut self, flag: bool) -> Self {
        self.fill_cache = flag;
        self
    }

    /// Reads from the given snapshot.
    ///
    /// The snapshot must stay alive while the read options are in use.
    #[must_use]
    pub fn snapshot(mut self, snapshot: &Snapshot) -> Self {
        self.snapshot = Some(snapshot.seqno());
        self
    }
}
