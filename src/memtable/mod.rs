// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    comparator::{Comparator, InternalKeyComparator},
    iter::InternalIterator,
    value::{append_internal_key, LookupKey, ParsedInternalKey, SeqNo, UserValue, ValueType},
};
use crossbeam_skiplist::SkipMap;
use std::{
    cmp::Ordering,
    ops::Bound,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
};

/// Approximate per-entry bookkeeping cost of the skiplist
const ENTRY_OVERHEAD: usize = 48;

/// Encoded internal key, ordered by the internal key comparator
#[derive(Clone)]
struct MemKey {
    bytes: Arc<[u8]>,
    comparator: InternalKeyComparator,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.comparator.compare(&self.bytes, &other.bytes) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator.compare(&self.bytes, &other.bytes)
    }
}

/// Result of a memtable point read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemTableGet {
    /// Newest visible entry is a value
    Found(UserValue),

    /// Newest visible entry is a tombstone
    Deleted,

    /// The memtable has no visible entry for the key
    NotFound,
}

/// The memtable serves as an intermediary storage for new items
///
/// Entries are internal keys, so multiple versions of a user key coexist,
/// newest first. Once frozen, a memtable is read-only and written to a
/// level-0 table.
pub struct MemTable {
    items: SkipMap<MemKey, UserValue>,
    cmp: InternalKeyComparator,

    /// Approximate memtable size
    ///
    /// If this grows too large, the memtable is frozen and flushed
    approximate_size: AtomicUsize,
}

impl MemTable {
    /// Creates an empty memtable.
    #[must_use]
    pub fn new(cmp: InternalKeyComparator) -> Self {
        Self {
            items: SkipMap::new(),
            cmp,
            approximate_size: AtomicUsize::default(),
        }
    }

    fn make_key(&self, internal_key: &[u8]) -> MemKey {
        MemKey {
            bytes: internal_key.into(),
            comparator: self.cmp.clone(),
        }
    }

    /// Inserts an entry.
    ///
    /// `value` is typically empty for deletions.
    pub fn add(&self, seqno: SeqNo, value_type: ValueType, user_key: &[u8], value: &[u8]) {
        let mut internal_key = Vec::with_capacity(user_key.len() + crate::value::TRAILER_SIZE);
        append_internal_key(&mut internal_key, user_key, seqno, value_type);

        let size = internal_key.len() + value.len() + ENTRY_OVERHEAD;

        self.items.insert(self.make_key(&internal_key), value.into());
        self.approximate_size.fetch_add(size, AtomicOrdering::AcqRel);
    }

    /// Returns the newest entry of the lookup key's user key that is
    /// visible at the lookup key's sequence number.
    pub fn get(&self, key: &LookupKey) -> MemTableGet {
        let target = self.make_key(key.internal_key());

        let Some(entry) = self.items.lower_bound(Bound::Included(&target)) else {
            return MemTableGet::NotFound;
        };

        let Some(parsed) = ParsedInternalKey::parse(&entry.key().bytes) else {
            return MemTableGet::NotFound;
        };

        if self.cmp.compare_user_keys(parsed.user_key, key.user_key()) != Ordering::Equal {
            return MemTableGet::NotFound;
        }

        match parsed.value_type {
            ValueType::Value => MemTableGet::Found(entry.value().clone()),
            ValueType::Deletion => MemTableGet::Deleted,
        }
    }

    /// Returns an iterator over the internal keys of the memtable.
    #[must_use]
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            table: self.clone(),
            current: None,
        }
    }

    /// Approximate memory used by the memtable, in bytes
    #[must_use]
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(AtomicOrdering::Acquire)
    }

    /// Number of entries, including tombstones and shadowed versions
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the memtable is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Cursor over a [`MemTable`]
///
/// The memtable may keep receiving inserts while the cursor is used;
/// new entries show up if they are ahead of the cursor.
pub struct MemTableIterator {
    table: Arc<MemTable>,
    current: Option<(MemKey, UserValue)>,
}

impl MemTableIterator {
    fn set_current(&mut self, entry: Option<crossbeam_skiplist::map::Entry<'_, MemKey, UserValue>>) {
        self.current = entry.map(|entry| (entry.key().clone(), entry.value().clone()));
    }
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let table = self.table.clone();
        self.set_current(table.items.front());
    }

    fn seek_to_last(&mut self) {
        let table = self.table.clone();
        self.set_current(table.items.back());
    }

    fn seek(&mut self, target: &[u8]) {
        let table = self.table.clone();
        let target = table.make_key(target);
        self.set_current(table.items.lower_bound(Bound::Included(&target)));
    }

    fn next(&mut self) {
        debug_assert!(self.valid());

        let table = self.table.clone();
        let entry = self
            .current
            .as_ref()
            .and_then(|(key, _)| table.items.lower_bound(Bound::Excluded(key)));

        self.set_current(entry);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());

        let table = self.table.clone();
        let entry = self
            .current
            .as_ref()
            .and_then(|(key, _)| table.items.upper_bound(Bound::Excluded(key)));

        self.set_current(entry);
    }

    fn key(&self) -> &[u8] {
        match &self.current {
            Some((key, _)) => &key.bytes,
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match &self.current {
            Some((_, value)) => value,
            None => &[],
        }
    }

    fn status(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{comparator::BytewiseComparator, iter::test_util, value::InternalKey};
    use test_log::test;

    fn memtable() -> Arc<MemTable> {
        Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))))
    }

    #[test]
    fn memtable_get() {
        let memtable = memtable();
        memtable.add(1, ValueType::Value, b"abc", b"v1");

        assert_eq!(
            MemTableGet::Found(Arc::from(*b"v1")),
            memtable.get(&LookupKey::new(b"abc", 5))
        );
        assert_eq!(MemTableGet::NotFound, memtable.get(&LookupKey::new(b"ab", 5)));
        assert_eq!(MemTableGet::NotFound, memtable.get(&LookupKey::new(b"abcd", 5)));
    }

    #[test]
    fn memtable_get_respects_seqno() {
        let memtable = memtable();
        memtable.add(1, ValueType::Value, b"abc", b"v1");
        memtable.add(2, ValueType::Value, b"abc", b"v2");
        memtable.add(3, ValueType::Deletion, b"abc", b"");
        memtable.add(4, ValueType::Value, b"abc", b"v4");

        let get = |seqno| memtable.get(&LookupKey::new(b"abc", seqno));

        assert_eq!(MemTableGet::NotFound, get(0));
        assert_eq!(MemTableGet::Found(Arc::from(*b"v1")), get(1));
        assert_eq!(MemTableGet::Found(Arc::from(*b"v2")), get(2));
        assert_eq!(MemTableGet::Deleted, get(3));
        assert_eq!(MemTableGet::Found(Arc::from(*b"v4")), get(4));
        assert_eq!(MemTableGet::Found(Arc::from(*b"v4")), get(100));
    }

    #[test]
    fn memtable_iter_order() {
        let memtable = memtable();
        memtable.add(3, ValueType::Value, b"b", b"b3");
        memtable.add(1, ValueType::Value, b"a", b"a1");
        memtable.add(5, ValueType::Value, b"b", b"b5");
        memtable.add(2, ValueType::Deletion, b"c", b"");

        let expected = vec![
            (InternalKey::new(b"a", 1, ValueType::Value), b"a1".to_vec()),
            (InternalKey::new(b"b", 5, ValueType::Value), b"b5".to_vec()),
            (InternalKey::new(b"b", 3, ValueType::Value), b"b3".to_vec()),
            (InternalKey::new(b"c", 2, ValueType::Deletion), vec![]),
        ]
        .into_iter()
        .map(|(k, v)| (k.encoded().to_vec(), v))
        .collect::<Vec<_>>();

        let mut iter = memtable.iter();
        assert_eq!(expected, test_util::collect_forward(&mut iter));

        let mut reversed = expected.clone();
        reversed.reverse();
        assert_eq!(reversed, test_util::collect_backward(&mut iter));

        iter.seek(InternalKey::new(b"b", 4, ValueType::Value).encoded());
        assert!(iter.valid());
        assert_eq!(
            InternalKey::new(b"b", 3, ValueType::Value).encoded(),
            iter.key()
        );

        iter.prev();
        assert_eq!(
            InternalKey::new(b"b", 5, ValueType::Value).encoded(),
            iter.key()
        );

        iter.seek(InternalKey::new(b"d", 100, ValueType::Value).encoded());
        assert!(!iter.valid());
    }

    #[test]
    fn memtable_memory_usage_grows() {
        let memtable = memtable();
        assert!(memtable.is_empty());
        assert_eq!(0, memtable.approximate_memory_usage());

        for idx in 0..100u64 {
            memtable.add(idx, ValueType::Value, &idx.to_be_bytes(), &[0; 100]);
        }

        assert_eq!(100, memtable.len());
        assert!(memtable.approximate_memory_usage() >= 100 * (100 + 16));
    }
}
