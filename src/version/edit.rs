// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{meta::FileMetaData, NUM_LEVELS};
use crate::{
    coding::{
        decode_length_prefixed_slice, decode_varint32, decode_varint64,
        put_length_prefixed_slice, put_varint32, put_varint64,
    },
    value::{InternalKey, SeqNo},
};
use std::collections::BTreeSet;

// Tag numbers for serialized edits; these numbers are written to disk
// and must not be changed. 8 was used for large value refs.
const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// Delta between two versions, as stored in the manifest
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SeqNo>,

    pub compact_pointers: Vec<(usize, InternalKey)>,

    /// (level, file number)
    pub deleted_files: BTreeSet<(usize, u64)>,

    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_owned());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, seqno: SeqNo) {
        self.last_sequence = Some(seqno);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Adds the specified file at the specified level.
    ///
    /// `smallest` and `largest` are the smallest and largest internal
    /// keys in the file.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            FileMetaData::new(number, file_size, smallest, largest),
        ));
    }

    /// Deletes the specified file from the specified level.
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    /// Serializes the edit.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::new();

        if let Some(name) = &self.comparator {
            put_varint32(&mut dst, TAG_COMPARATOR);
            put_length_prefixed_slice(&mut dst, name.as_bytes());
        }
        if let Some(number) = self.log_number {
            put_varint32(&mut dst, TAG_LOG_NUMBER);
            put_varint64(&mut dst, number);
        }
        if let Some(number) = self.prev_log_number {
            put_varint32(&mut dst, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut dst, number);
        }
        if let Some(number) = self.next_file_number {
            put_varint32(&mut dst, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut dst, number);
        }
        if let Some(seqno) = self.last_sequence {
            put_varint32(&mut dst, TAG_LAST_SEQUENCE);
            put_varint64(&mut dst, seqno);
        }

        for (level, key) in &self.compact_pointers {
            put_varint32(&mut dst, TAG_COMPACT_POINTER);
            put_varint32(&mut dst, encode_level(*level));
            put_length_prefixed_slice(&mut dst, key.encoded());
        }

        for (level, number) in &self.deleted_files {
            put_varint32(&mut dst, TAG_DELETED_FILE);
            put_varint32(&mut dst, encode_level(*level));
            put_varint64(&mut dst, *number);
        }

        for (level, f) in &self.new_files {
            put_varint32(&mut dst, TAG_NEW_FILE);
            put_varint32(&mut dst, encode_level(*level));
            put_varint64(&mut dst, f.number);
            put_varint64(&mut dst, f.file_size);
            put_length_prefixed_slice(&mut dst, f.smallest.encoded());
            put_length_prefixed_slice(&mut dst, f.largest.encoded());
        }

        dst
    }

    /// Parses a serialized edit.
    ///
    /// # Errors
    ///
    /// Returns a corruption error naming the first malformed field.
    pub fn decode(src: &[u8]) -> crate::Result<Self> {
        let mut edit = Self::default();
        let mut input = EditInput(src);

        while !input.0.is_empty() {
            let Some(tag) = input.varint32() else {
                return Err(corruption("invalid tag"));
            };

            match tag {
                TAG_COMPARATOR => {
                    let name = input
                        .slice()
                        .and_then(|name| std::str::from_utf8(name).ok())
                        .ok_or_else(|| corruption("comparator name"))?;
                    edit.comparator = Some(name.to_owned());
                }
                TAG_LOG_NUMBER => {
                    edit.log_number = Some(input.varint64().ok_or_else(|| corruption("log number"))?);
                }
                TAG_PREV_LOG_NUMBER => {
                    edit.prev_log_number = Some(
                        input
                            .varint64()
                            .ok_or_else(|| corruption("previous log number"))?,
                    );
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(
                        input
                            .varint64()
                            .ok_or_else(|| corruption("next file number"))?,
                    );
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(
                        input
                            .varint64()
                            .ok_or_else(|| corruption("last sequence number"))?,
                    );
                }
                TAG_COMPACT_POINTER => {
                    let level = input.level().ok_or_else(|| corruption("compaction pointer"))?;
                    let key = input
                        .internal_key()
                        .ok_or_else(|| corruption("compaction pointer"))?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = input.level().ok_or_else(|| corruption("deleted file"))?;
                    let number = input.varint64().ok_or_else(|| corruption("deleted file"))?;
                    edit.deleted_files.insert((level, number));
                }
                TAG_NEW_FILE => {
                    let entry = input.new_file().ok_or_else(|| corruption("new-file entry"))?;
                    edit.new_files.push(entry);
                }
                _ => {
                    return Err(corruption("unknown tag"));
                }
            }
        }

        Ok(edit)
    }
}

fn encode_level(level: usize) -> u32 {
    debug_assert!(level < NUM_LEVELS);
    u32::try_from(level).unwrap_or(u32::MAX)
}

fn corruption(field: &str) -> crate::Error {
    crate::Error::Corruption(format!("VersionEdit: {field}"))
}

/// Cursor over an encoded edit
struct EditInput<'a>(&'a [u8]);

impl<'a> EditInput<'a> {
    fn advance(&mut self, n: usize) {
        self.0 = self.0.get(n..).unwrap_or_default();
    }

    fn varint32(&mut self) -> Option<u32> {
        let (value, n) = decode_varint32(self.0)?;
        self.advance(n);
        Some(value)
    }

    fn varint64(&mut self) -> Option<u64> {
        let (value, n) = decode_varint64(self.0)?;
        self.advance(n);
        Some(value)
    }

    fn slice(&mut self) -> Option<&'a [u8]> {
        let (slice, n) = decode_length_prefixed_slice(self.0)?;
        self.advance(n);
        Some(slice)
    }

    fn level(&mut self) -> Option<usize> {
        let level = self.varint32()? as usize;
        (level < NUM_LEVELS).then_some(level)
    }

    fn internal_key(&mut self) -> Option<InternalKey> {
        self.slice().map(InternalKey::decode_from)
    }

    fn new_file(&mut self) -> Option<(usize, FileMetaData)> {
        let level = self.level()?;
        let number = self.varint64()?;
        let file_size = self.varint64()?;
        let smallest = self.internal_key()?;
        let largest = self.internal_key()?;
        Some((level, FileMetaData::new(number, file_size, smallest, largest)))
    }
}
