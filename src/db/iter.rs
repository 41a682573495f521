// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::DbInner;
use crate::{
    comparator::Comparator,
    iter::BoxedIterator,
    value::{
        append_internal_key, extract_user_key, ParsedInternalKey, SeqNo, ValueType,
        VALUE_TYPE_FOR_SEEK,
    },
    version::Version,
};
use std::{cmp::Ordering, sync::Arc};

/// Bytes read between two read samples
const READ_BYTES_PERIOD: usize = /* 1 MiB */ 1_024 * 1_024;

/// Values larger than this are not kept in a reused buffer
const MAX_RETAINED_VALUE_CAPACITY: usize = /* 1 MiB */ 1_024 * 1_024;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Direction {
    /// The inner iterator is positioned at the entry that yields `key()`
    Forward,

    /// The inner iterator is positioned just before all entries whose user
    /// key equals `key()`
    Reverse,
}

/// Cursor over the live key-value pairs of a database
///
/// Each user key is yielded once, with its newest value visible at the
/// iterator's sequence number; deleted keys are skipped.
///
/// ```
/// use levelkv::{Db, Options, ReadOptions, WriteOptions};
/// #
/// # let folder = tempfile::tempdir()?;
/// # let db = Db::open(&folder, Options::default().create_if_missing(true))?;
///
/// db.put(&WriteOptions::default(), "a", "1")?;
/// db.put(&WriteOptions::default(), "b", "2")?;
///
/// let mut iter = db.iter(&ReadOptions::default());
/// iter.seek_to_first();
///
/// while iter.valid() {
///     println!("{:?} => {:?}", iter.key(), iter.value());
///     iter.next();
/// }
///
/// iter.status()?;
/// #
/// # Ok::<_, levelkv::Error>(())
/// ```
pub struct DbIterator {
    db: Arc<DbInner>,

    /// Keeps the files being read alive
    version: Arc<Version>,

    iter: BoxedIterator,
    ucmp: Arc<dyn Comparator>,
    sequence: SeqNo,

    status: Option<crate::Error>,

    /// Current key when direction is reverse
    saved_key: Vec<u8>,

    /// Current value when direction is reverse
    saved_value: Vec<u8>,

    direction: Direction,
    valid: bool,

    bytes_until_read_sampling: usize,
}

impl DbIterator {
    pub(crate) fn new(
        db: Arc<DbInner>,
        version: Arc<Version>,
        iter: BoxedIterator,
        sequence: SeqNo,
    ) -> Self {
        let ucmp = db.icmp.user_comparator().clone();

        Self {
            db,
            version,
            iter,
            ucmp,
            sequence,
            status: None,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            direction: Direction::Forward,
            valid: false,
            bytes_until_read_sampling: READ_BYTES_PERIOD,
        }
    }

    /// Returns `true` if the iterator is positioned at an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Returns the key of the current entry.
    ///
    /// Must only be called while the iterator is valid.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);

        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// Returns the value of the current entry.
    ///
    /// Must only be called while the iterator is valid.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);

        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// Returns the first error encountered, if any.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a table could not be read or holds a corrupted key.
    pub fn status(&self) -> crate::Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => self.iter.status(),
        }
    }

    /// Parses the current internal key, sampling reads along the way.
    fn parse_key(&mut self) -> Option<(SeqNo, ValueType)> {
        let bytes_read = self.iter.key().len() + self.iter.value().len();

        while self.bytes_until_read_sampling < bytes_read {
            self.bytes_until_read_sampling += READ_BYTES_PERIOD;
            self.db.record_read_sample(&self.version, self.iter.key());
        }

        self.bytes_until_read_sampling -= bytes_read;

        if let Some(parsed) = ParsedInternalKey::parse(self.iter.key()) {
            Some((parsed.seqno, parsed.value_type))
        } else {
            self.status = Some(crate::Error::corruption(
                "corrupted internal key in DbIterator",
            ));
            None
        }
    }

    fn save_current_user_key(&mut self) {
        self.saved_key.clear();
        self.saved_key
            .extend_from_slice(extract_user_key(self.iter.key()));
    }

    fn clear_saved_value(&mut self) {
        if self.saved_value.capacity() > MAX_RETAINED_VALUE_CAPACITY {
            self.saved_value = Vec::new();
        } else {
            self.saved_value.clear();
        }
    }

    /// Moves to the next entry.
    ///
    /// Must only be called while the iterator is valid.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // Switch directions
            self.direction = Direction::Forward;

            // The inner iterator is pointing just before the entries for
            // key(), so advance into the range of entries for key() and
            // then use the normal skipping code below.
            if self.iter.valid() {
                self.iter.next();
            } else {
                self.iter.seek_to_first();
            }

            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }

            // saved_key already contains the key to skip past
        } else {
            // Store in saved_key the current key so we skip it below
            self.save_current_user_key();

            // The inner iterator is pointing to the current key. We can
            // now safely move to the next to avoid checking the current
            // key.
            self.iter.next();

            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    fn find_next_user_entry(&mut self, mut skipping: bool) {
        // Loop until we hit an acceptable entry to yield
        debug_assert!(self.iter.valid());
        debug_assert_eq!(self.direction, Direction::Forward);

        loop {
            if let Some((seqno, value_type)) = self.parse_key() {
                if seqno <= self.sequence {
                    let user_key = extract_user_key(self.iter.key());

                    match value_type {
                        ValueType::Deletion => {
                            // Arrange to skip all upcoming entries for this
                            // key since they are hidden by this deletion.
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(user_key);
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self.ucmp.compare(user_key, &self.saved_key) != Ordering::Greater;

                            if !hidden {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }

            self.iter.next();

            if !self.iter.valid() {
                break;
            }
        }

        self.saved_key.clear();
        self.valid = false;
    }

    /// Moves to the previous entry.
    ///
    /// Must only be called while the iterator is valid.
    pub fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // Switch directions
            //
            // The inner iterator is pointing at the current entry. Scan
            // backwards until the key changes so we can use the normal
            // reverse scanning code.
            debug_assert!(self.iter.valid());
            self.save_current_user_key();

            loop {
                self.iter.prev();

                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.clear_saved_value();
                    return;
                }

                let user_key = extract_user_key(self.iter.key());

                if self.ucmp.compare(user_key, &self.saved_key) == Ordering::Less {
                    break;
                }
            }

            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    fn find_prev_user_entry(&mut self) {
        debug_assert_eq!(self.direction, Direction::Reverse);

        let mut value_type = ValueType::Deletion;

        if self.iter.valid() {
            loop {
                if let Some((seqno, entry_type)) = self.parse_key() {
                    if seqno <= self.sequence {
                        let user_key = extract_user_key(self.iter.key());

                        if value_type != ValueType::Deletion
                            && self.ucmp.compare(user_key, &self.saved_key) == Ordering::Less
                        {
                            // We encountered a non-deleted value in entries
                            // for previous keys
                            break;
                        }

                        value_type = entry_type;

                        if value_type == ValueType::Deletion {
                            self.saved_key.clear();
                            self.clear_saved_value();
                        } else {
                            self.save_current_user_key();
                            self.clear_saved_value();
                            self.saved_value.extend_from_slice(self.iter.value());
                        }
                    }
                }

                self.iter.prev();

                if !self.iter.valid() {
                    break;
                }
            }
        }

        if value_type == ValueType::Deletion {
            // End
            self.valid = false;
            self.saved_key.clear();
            self.clear_saved_value();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    /// Positions the iterator at the first key that is at or past `target`.
    pub fn seek<K: AsRef<[u8]>>(&mut self, target: K) {
        self.direction = Direction::Forward;
        self.clear_saved_value();
        self.saved_key.clear();

        append_internal_key(
            &mut self.saved_key,
            target.as_ref(),
            self.sequence,
            VALUE_TYPE_FOR_SEEK,
        );

        self.iter.seek(&self.saved_key);

        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Positions the iterator at the first key.
    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.clear_saved_value();
        self.iter.seek_to_first();

        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Positions the iterator at the last key.
    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.clear_saved_value();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }
}
