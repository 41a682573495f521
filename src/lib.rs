// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! LevelKV is an embeddable, ordered key-value storage engine in the style of `LevelDB`. It features:
//!
//! - Thread-safe API with arbitrary byte keys and values
//! - 100% safe & stable Rust
//! - Log-structured merge tree with levelled compaction
//! - Write-ahead journal with group commit
//! - Snapshots and forward & reverse iteration
//! - Bloom filters and a shared block cache
//! - Built-in compression (default = `LZ4`)
//! - On-disk format compatible with `LevelDB` tables, journals and manifests
//!
//! It is not:
//!
//! - a standalone server
//! - a relational database: it has no notion of columns or schemas
//! - multi-process: a directory can only be opened by one handle at a time
//!
//! ```
//! use levelkv::{Db, Options, ReadOptions, WriteBatch, WriteOptions};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Db::open(&folder, Options::default().create_if_missing(true))?;
//!
//! // Write some data
//! db.put(&WriteOptions::default(), "a", "hello")?;
//!
//! // And retrieve it
//! let value = db.get(&ReadOptions::default(), "a")?;
//! assert_eq!(Some(b"hello".as_slice()), value.as_deref());
//!
//! // Or remove it again
//! db.delete(&WriteOptions::default(), "a")?;
//!
//! // Apply multiple updates atomically
//! let mut batch = WriteBatch::new();
//! batch.put("b", "1");
//! batch.put("c", "2");
//! db.write(&WriteOptions::default().sync(true), batch)?;
//!
//! // Iterate over all keys
//! let mut iter = db.iter(&ReadOptions::default());
//! iter.seek_to_first();
//!
//! while iter.valid() {
//!     // ...
//!     iter.next();
//! }
//! #
//! # Ok::<_, levelkv::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod batch;
mod block_cache;
mod bloom;
mod checksum;
mod coding;
mod compaction;
mod comparator;
mod config;
mod db;
mod error;
mod file;
mod flush;
mod info_log;
mod iter;
mod journal;
mod locked_file;
mod memtable;
mod merge;
mod range;
mod snapshot;
mod stats;
mod table;
mod table_cache;
mod value;
mod version;

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, xxhash_rust::xxh3::Xxh3Builder>;
pub(crate) type HashSet<K> = std::collections::HashSet<K, xxhash_rust::xxh3::Xxh3Builder>;

pub use {
    batch::{Handler as WriteBatchHandler, WriteBatch},
    block_cache::BlockCache,
    bloom::{BloomFilterPolicy, FilterPolicy},
    comparator::{BytewiseComparator, Comparator},
    config::{CompressionType, Options, ReadOptions, WriteOptions},
    db::{destroy_db, repair_db, Db, DbIterator},
    error::{Error, Result},
    range::Range,
    snapshot::Snapshot,
    value::{SeqNo, UserKey, UserValue},
};
