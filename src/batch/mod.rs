// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{decode_fixed32, decode_fixed64, decode_length_prefixed_slice, put_length_prefixed_slice},
    memtable::MemTable,
    value::{SeqNo, ValueType},
};
use byteorder::{ByteOrder, LittleEndian};

/// Header is sequence number (8 bytes) followed by count (4 bytes)
const HEADER_SIZE: usize = 12;

/// Receives the operations of a [`WriteBatch`] in insertion order
pub trait Handler {
    /// Called for every put.
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Called for every deletion.
    fn delete(&mut self, key: &[u8]);
}

/// An atomic write batch
///
/// All operations in a batch are applied together or not at all, and
/// receive consecutive sequence numbers in insertion order.
///
/// # Disk representation
///
/// \[seqno; u64 LE] \[count; u32 LE] \[record]*
///
/// where a record is either
///
/// \[1] \[key; varint-prefixed] \[value; varint-prefixed]
///
/// or
///
/// \[0] \[key; varint-prefixed]
///
/// The journal stores batches in exactly this encoding.
///
/// # Examples
///
/// ```
/// # use levelkv::WriteBatch;
/// let mut batch = WriteBatch::new();
/// batch.put("a", "1").delete("b").put("c", "3");
///
/// assert_eq!(3, batch.count());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self {
            rep: vec![0; HEADER_SIZE],
        }
    }
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` for `key`.
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) -> &mut Self {
        self.set_count(self.count() + 1);
        self.rep.push(u8::from(ValueType::Value));
        put_length_prefixed_slice(&mut self.rep, key.as_ref());
        put_length_prefixed_slice(&mut self.rep, value.as_ref());
        self
    }

    /// Removes `key`, if it exists.
    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) -> &mut Self {
        self.set_count(self.count() + 1);
        self.rep.push(u8::from(ValueType::Deletion));
        put_length_prefixed_slice(&mut self.rep, key.as_ref());
        self
    }

    /// Removes all operations.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    /// Number of operations in the batch
    #[must_use]
    pub fn count(&self) -> u32 {
        self.rep.get(8..HEADER_SIZE).map_or(0, decode_fixed32)
    }

    /// Returns `true` if the batch has no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Size of the encoded batch in bytes
    ///
    /// This includes the header, so an empty batch is not zero-sized.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Appends all operations of `other`, keeping their order.
    pub fn append(&mut self, other: &Self) -> &mut Self {
        debug_assert!(other.rep.len() >= HEADER_SIZE);

        self.set_count(self.count() + other.count());
        self.rep
            .extend_from_slice(other.rep.get(HEADER_SIZE..).unwrap_or_default());
        self
    }

    /// Feeds all operations to `handler`, in order.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the encoding is malformed.
    pub fn iterate<H: Handler>(&self, handler: &mut H) -> crate::Result<()> {
        let Some(mut input) = self.rep.get(HEADER_SIZE..) else {
            return Err(crate::Error::corruption("malformed WriteBatch (too small)"));
        };

        let mut found = 0;

        while let Some((&tag, rest)) = input.split_first() {
            found += 1;
            input = rest;

            match ValueType::try_from(tag) {
                Ok(ValueType::Value) => {
                    let parsed = decode_length_prefixed_slice(input).and_then(|(key, n)| {
                        let rest = input.get(n..)?;
                        decode_length_prefixed_slice(rest).map(|(value, m)| (key, value, n + m))
                    });

                    let Some((key, value, consumed)) = parsed else {
                        return Err(crate::Error::corruption("bad WriteBatch Put"));
                    };

                    handler.put(key, value);
                    input = input.get(consumed..).unwrap_or_default();
                }
                Ok(ValueType::Deletion) => {
                    let Some((key, consumed)) = decode_length_prefixed_slice(input) else {
                        return Err(crate::Error::corruption("bad WriteBatch Delete"));
                    };

                    handler.delete(key);
                    input = input.get(consumed..).unwrap_or_default();
                }
                Err(_) => {
                    return Err(crate::Error::corruption("unknown WriteBatch tag"));
                }
            }
        }

        if found == self.count() {
            Ok(())
        } else {
            Err(crate::Error::corruption("WriteBatch has wrong count"))
        }
    }

    pub(crate) fn sequence(&self) -> SeqNo {
        self.rep.get(..8).map_or(0, decode_fixed64)
    }

    pub(crate) fn set_sequence(&mut self, seqno: SeqNo) {
        if let Some(header) = self.rep.get_mut(..8) {
            LittleEndian::write_u64(header, seqno);
        }
    }

    fn set_count(&mut self, count: u32) {
        if let Some(header) = self.rep.get_mut(8..HEADER_SIZE) {
            LittleEndian::write_u32(header, count);
        }
    }

    /// Encoded batch, as stored in the journal
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Replaces the batch with an encoded batch read from the journal.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if `contents` is too small to be a batch.
    pub(crate) fn set_contents(&mut self, contents: &[u8]) -> crate::Result<()> {
        if contents.len() < HEADER_SIZE {
            return Err(crate::Error::corruption("log record too small"));
        }

        self.rep.clear();
        self.rep.extend_from_slice(contents);

        Ok(())
    }

    /// Applies the batch to a memtable, starting at the batch's sequence number.
    pub(crate) fn insert_into(&self, memtable: &MemTable) -> crate::Result<()> {
        let mut inserter = MemTableInserter {
            seqno: self.sequence(),
            memtable,
        };
        self.iterate(&mut inserter)
    }
}

struct MemTableInserter<'a> {
    seqno: SeqNo,
    memtable: &'a MemTable,
}

impl Handler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.memtable.add(self.seqno, ValueType::Value, key, value);
        self.seqno += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.memtable.add(self.seqno, ValueType::Deletion, key, &[]);
        self.seqno += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comparator::{BytewiseComparator, InternalKeyComparator},
        iter::InternalIterator,
        value::ParsedInternalKey,
    };
    use std::sync::Arc;
    use test_log::test;

    fn print_contents(batch: &WriteBatch) -> String {
        let memtable = Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))));

        let result = batch.insert_into(&memtable);

        let mut state = String::new();
        let mut count = 0;

        let mut iter = memtable.iter();
        iter.seek_to_first();

        while iter.valid() {
            let Some(parsed) = ParsedInternalKey::parse(iter.key()) else {
                panic!("invalid internal key");
            };

            let key = String::from_utf8_lossy(parsed.user_key);

            match parsed.value_type {
                ValueType::Value => {
                    let value = String::from_utf8_lossy(iter.value());
                    state.push_str(&format!("Put({key}, {value})"));
                }
                ValueType::Deletion => {
                    state.push_str(&format!("Delete({key})"));
                }
            }

            state.push_str(&format!("@{}", parsed.seqno));
            count += 1;
            iter.next();
        }

        if result.is_err() {
            state.push_str("ParseError()");
        } else if count != batch.count() {
            state.push_str("CountMismatch()");
        }

        state
    }

    #[test]
    fn write_batch_empty() {
        let batch = WriteBatch::new();
        assert_eq!("", print_contents(&batch));
        assert_eq!(0, batch.count());
        assert!(batch.is_empty());
    }

    #[test]
    fn write_batch_multiple() {
        let mut batch = WriteBatch::new();
        batch.put("foo", "bar").delete("box").put("baz", "boo");
        batch.set_sequence(100);

        assert_eq!(100, batch.sequence());
        assert_eq!(3, batch.count());
        assert_eq!(
            "Put(baz, boo)@102Delete(box)@101Put(foo, bar)@100",
            print_contents(&batch)
        );
    }

    #[test]
    fn write_batch_corruption() -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.put("foo", "bar").delete("box");
        batch.set_sequence(200);

        let contents = batch.contents().to_vec();
        batch.set_contents(contents.get(..contents.len() - 1).unwrap_or_default())?;

        assert_eq!("Put(foo, bar)@200ParseError()", print_contents(&batch));

        Ok(())
    }

    #[test]
    fn write_batch_too_small() {
        let mut batch = WriteBatch::new();
        assert!(matches!(batch.set_contents(&[0; 5]), Err(e) if e.is_corruption()));
    }

    #[test]
    fn write_batch_append() {
        let mut b1 = WriteBatch::new();
        let mut b2 = WriteBatch::new();
        b1.set_sequence(200);
        b2.set_sequence(300);

        b1.append(&b2);
        assert_eq!("", print_contents(&b1));

        b2.put("a", "va");
        b1.append(&b2);
        assert_eq!("Put(a, va)@200", print_contents(&b1));

        b2.clear();
        b2.put("b", "vb");
        b1.append(&b2);
        assert_eq!("Put(a, va)@200Put(b, vb)@201", print_contents(&b1));

        b2.delete("foo");
        b1.append(&b2);
        assert_eq!(
            "Put(a, va)@200Put(b, vb)@202Put(b, vb)@201Delete(foo)@203",
            print_contents(&b1)
        );
    }

    #[test]
    fn write_batch_approximate_size() {
        let mut batch = WriteBatch::new();
        let empty_size = batch.approximate_size();

        batch.put("foo", "bar");
        let one_key_size = batch.approximate_size();
        assert!(empty_size < one_key_size);

        batch.put("baz", "boo");
        let two_keys_size = batch.approximate_size();
        assert!(one_key_size < two_keys_size);

        batch.delete("box");
        let post_delete_size = batch.approximate_size();
        assert!(two_keys_size < post_delete_size);
    }

    #[test]
    fn write_batch_roundtrip_contents() -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.put("a", "1").delete("b").put("c", "3");
        batch.set_sequence(42);

        let mut decoded = WriteBatch::new();
        decoded.set_contents(batch.contents())?;
        assert_eq!(batch, decoded);

        Ok(())
    }
}
