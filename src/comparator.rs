// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{decode_fixed64, put_fixed64},
    value::{extract_user_key, pack_trailer, MAX_SEQUENCE_NUMBER, TRAILER_SIZE, VALUE_TYPE_FOR_SEEK},
};
use std::{cmp::Ordering, sync::Arc};

/// Total order over keys
///
/// The comparator's name is persisted in the manifest; reopening a
/// database with a differently named comparator fails.
pub trait Comparator: Send + Sync {
    /// Stable name of this ordering.
    fn name(&self) -> &str;

    /// Three-way comparison.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// If `start < limit`, shortens `start` to a key in `[start, limit)`.
    ///
    /// Used to keep index blocks small. Leaving `start` untouched is
    /// always correct.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// Changes `key` to a short key that is `>= key`.
    ///
    /// Leaving `key` untouched is always correct.
    fn find_short_successor(&self, key: &mut Vec<u8>);
}

/// Lexicographic byte-wise ordering
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "leveldb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let diff_index = start
            .iter()
            .zip(limit.iter())
            .take_while(|(a, b)| a == b)
            .count();

        if diff_index >= start.len().min(limit.len()) {
            // One string is a prefix of the other
            return;
        }

        let (Some(&diff_byte), Some(&limit_byte)) = (start.get(diff_index), limit.get(diff_index))
        else {
            return;
        };

        if diff_byte < 0xff && diff_byte + 1 < limit_byte {
            if let Some(byte) = start.get_mut(diff_index) {
                *byte += 1;
            }
            start.truncate(diff_index + 1);
            debug_assert_eq!(Ordering::Less, self.compare(start, limit));
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        if let Some(idx) = key.iter().position(|&b| b != 0xff) {
            if let Some(byte) = key.get_mut(idx) {
                *byte += 1;
            }
            key.truncate(idx + 1);
        }

        // NOTE: key is a run of 0xff, leave it alone
    }
}

/// Orders internal keys by user key ascending, then by trailer
/// (sequence number and type) descending
#[derive(Clone)]
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl std::fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InternalKeyComparator({})", self.user_comparator.name())
    }
}

impl InternalKeyComparator {
    /// Wraps a user comparator.
    #[must_use]
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        Self { user_comparator }
    }

    /// Returns the wrapped user comparator.
    #[must_use]
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user_comparator
    }

    /// Compares only the user key parts of two internal keys.
    pub(crate) fn compare_user_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user_comparator.compare(a, b)
    }
}

fn trailer_of(internal_key: &[u8]) -> u64 {
    internal_key
        .len()
        .checked_sub(TRAILER_SIZE)
        .and_then(|split| internal_key.get(split..))
        .map_or(0, decode_fixed64)
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &str {
        "leveldb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
            .then_with(|| trailer_of(b).cmp(&trailer_of(a)))
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);

        let mut tmp = user_start.to_vec();
        self.user_comparator
            .find_shortest_separator(&mut tmp, user_limit);

        if tmp.len() < user_start.len()
            && self.user_comparator.compare(user_start, &tmp) == Ordering::Less
        {
            // User key has become shorter physically, but larger logically.
            // Tack on the earliest possible number to the shortened user key.
            put_fixed64(
                &mut tmp,
                pack_trailer(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(Ordering::Less, self.compare(start, &tmp));
            debug_assert_eq!(Ordering::Less, self.compare(&tmp, limit));
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);

        let mut tmp = user_key.to_vec();
        self.user_comparator.find_short_successor(&mut tmp);

        if tmp.len() < user_key.len()
            && self.user_comparator.compare(user_key, &tmp) == Ordering::Less
        {
            put_fixed64(
                &mut tmp,
                pack_trailer(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(Ordering::Less, self.compare(key, &tmp));
            *key = tmp;
        }
    }
}
