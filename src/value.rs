// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{decode_fixed64, put_fixed64};
use std::sync::Arc;

/// User defined key
pub type UserKey = Arc<[u8]>;

/// User defined data (blob of bytes)
pub type UserValue = Arc<[u8]>;

/// Sequence number, a monotonically increasing counter
///
/// Every entry of a write batch gets its own sequence number.
///
/// A value with a higher sequence number shadows an item with the
/// same key and lower sequence number. Only the low 56 bits are used,
/// the remaining byte of the trailer stores the [`ValueType`].
pub type SeqNo = u64;

/// Largest sequence number that fits into an internal key trailer
pub const MAX_SEQUENCE_NUMBER: SeqNo = (1 << 56) - 1;

/// Length of the trailer appended to every user key
pub(crate) const TRAILER_SIZE: usize = 8;

/// Value type (regular value or tombstone)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum ValueType {
    /// Deleted value
    Deletion,

    /// Existing value
    Value,
}

/// Value type used when building a key to seek to.
///
/// Sorting is by decreasing type within the same sequence number,
/// so seeking with the highest type finds every entry of that sequence.
pub(crate) const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl TryFrom<u8> for ValueType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Deletion),
            1 => Ok(Self::Value),
            tag => Err(tag),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Deletion => 0,
            ValueType::Value => 1,
        }
    }
}

/// Packs a sequence number and value type into a trailer.
#[must_use]
pub(crate) fn pack_trailer(seqno: SeqNo, value_type: ValueType) -> u64 {
    debug_assert!(seqno <= MAX_SEQUENCE_NUMBER);
    (seqno << 8) | u64::from(u8::from(value_type))
}

/// Appends the internal key encoding of (`user_key`, `seqno`, `value_type`).
pub(crate) fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    seqno: SeqNo,
    value_type: ValueType,
) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_trailer(seqno, value_type));
}

/// Returns the user key part of an encoded internal key.
///
/// Malformed keys (shorter than the trailer) yield an empty slice.
#[must_use]
pub(crate) fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    internal_key
        .get(..internal_key.len().saturating_sub(TRAILER_SIZE))
        .unwrap_or_default()
}

/// Borrowed view of an encoded internal key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// User key
    pub user_key: &'a [u8],

    /// Sequence number
    pub seqno: SeqNo,

    /// Value type
    pub value_type: ValueType,
}

impl std::fmt::Debug for ParsedInternalKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            String::from_utf8_lossy(self.user_key),
            self.seqno,
            u8::from(self.value_type)
        )
    }
}

impl<'a> ParsedInternalKey<'a> {
    /// Parses an encoded internal key.
    ///
    /// Returns `None` if the key is too short or carries an unknown type.
    #[must_use]
    pub fn parse(internal_key: &'a [u8]) -> Option<Self> {
        let split = internal_key.len().checked_sub(TRAILER_SIZE)?;
        let (user_key, trailer) = internal_key.split_at(split);
        let trailer = decode_fixed64(trailer);

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        let value_type = ValueType::try_from((trailer & 0xff) as u8).ok()?;

        Some(Self {
            user_key,
            seqno: trailer >> 8,
            value_type,
        })
    }
}

/// Owned, encoded internal key
///
/// `user_key ‖ fixed64(seqno << 8 | type)`
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct InternalKey(Vec<u8>);

impl InternalKey {
    /// Encodes a new internal key.
    #[must_use]
    pub fn new(user_key: &[u8], seqno: SeqNo, value_type: ValueType) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        append_internal_key(&mut buf, user_key, seqno, value_type);
        Self(buf)
    }

    /// Wraps already encoded bytes.
    #[must_use]
    pub fn decode_from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Returns the encoded bytes.
    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// Returns the user key part.
    #[must_use]
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }

    /// Parses the encoded key.
    #[must_use]
    pub fn parsed(&self) -> Option<ParsedInternalKey<'_>> {
        ParsedInternalKey::parse(&self.0)
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.parsed() {
            Some(parsed) => write!(f, "{parsed:?}"),
            None => write!(f, "(bad){:?}", String::from_utf8_lossy(&self.0)),
        }
    }
}

/// Key used for point lookups in memtables and tables
///
/// Encodes the user key with the read snapshot so that a seek lands
/// on the newest entry visible at that sequence number.
pub struct LookupKey {
    internal_key: Vec<u8>,
}

impl LookupKey {
    /// Creates a lookup key for `user_key` as seen at `seqno`.
    #[must_use]
    pub fn new(user_key: &[u8], seqno: SeqNo) -> Self {
        let mut internal_key = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        append_internal_key(&mut internal_key, user_key, seqno, VALUE_TYPE_FOR_SEEK);
        Self { internal_key }
    }

    /// Returns the encoded internal key.
    #[must_use]
    pub fn internal_key(&self) -> &[u8] {
        &self.internal_key
    }

    /// Returns the user key.
    #[must_use]
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.internal_key)
    }
}
