// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{decode_fixed32, decode_varint32},
    comparator::Comparator,
    iter::InternalIterator,
};
use std::{cmp::Ordering, sync::Arc};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Immutable, parsed block of prefix-compressed entries
///
/// See [`super::block_builder::BlockBuilder`] for the layout.
pub struct Block {
    data: Vec<u8>,

    /// Offset of the restart array
    restart_offset: usize,

    num_restarts: usize,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block(size={}, restarts={})",
            self.data.len(),
            self.num_restarts
        )
    }
}

impl Block {
    /// Parses uncompressed block contents.
    pub fn new(data: Vec<u8>) -> crate::Result<Self> {
        let size = data.len();

        if size < U32_SIZE {
            return Err(crate::Error::corruption("bad block contents"));
        }

        let num_restarts = decode_fixed32(data.get(size - U32_SIZE..).unwrap_or_default()) as usize;
        let max_restarts_allowed = (size - U32_SIZE) / U32_SIZE;

        if num_restarts > max_restarts_allowed {
            // The size is too small for num_restarts
            return Err(crate::Error::corruption("bad block contents"));
        }

        Ok(Self {
            restart_offset: size - (1 + num_restarts) * U32_SIZE,
            num_restarts,
            data,
        })
    }

    /// Size of the block contents in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Creates a cursor over the block's entries.
    pub fn iter(self: &Arc<Self>, comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            block: self.clone(),
            comparator,
            current: self.restart_offset,
            restart_index: self.num_restarts,
            key: Vec::new(),
            value_offset: self.restart_offset,
            value_len: 0,
            error: None,
        }
    }

    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts);
        let offset = self.restart_offset + index * U32_SIZE;
        self.data
            .get(offset..offset + U32_SIZE)
            .map_or(0, |bytes| decode_fixed32(bytes) as usize)
    }
}

/// Entry header: shared key length, unshared key length, value length
/// and the offset of the unshared key bytes
fn decode_entry(data: &[u8], offset: usize, limit: usize) -> Option<(usize, usize, usize, usize)> {
    let src = data.get(offset..limit)?;

    let (shared, n1) = decode_varint32(src)?;
    let (non_shared, n2) = decode_varint32(src.get(n1..)?)?;
    let (value_len, n3) = decode_varint32(src.get(n1 + n2..)?)?;

    let header_len = n1 + n2 + n3;
    let (non_shared, value_len) = (non_shared as usize, value_len as usize);

    if src.len() - header_len < non_shared + value_len {
        return None;
    }

    Some((shared as usize, non_shared, value_len, offset + header_len))
}

/// Cursor over a [`Block`]
pub struct BlockIter {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,

    /// Offset of the current entry; `restart_offset` if invalid
    current: usize,

    /// Index of the restart block in which `current` falls
    restart_index: usize,

    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    error: Option<crate::Error>,
}

impl BlockIter {
    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    fn mark_invalid(&mut self) {
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
    }

    fn corruption_error(&mut self) {
        self.mark_invalid();
        self.error = Some(crate::Error::corruption("bad entry in block"));
        self.key.clear();
        self.value_offset = self.block.restart_offset;
        self.value_len = 0;
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;

        // NOTE: current will be fixed by parse_next_key
        // parse_next_key starts at the end of the current value
        self.value_offset = self.block.restart_point(index);
        self.value_len = 0;
    }

    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();

        let limit = self.block.restart_offset;
        if self.current >= limit {
            // No more entries to return, mark as invalid
            self.mark_invalid();
            return false;
        }

        let Some((shared, non_shared, value_len, key_offset)) =
            decode_entry(&self.block.data, self.current, limit)
        else {
            self.corruption_error();
            return false;
        };

        if self.key.len() < shared {
            self.corruption_error();
            return false;
        }

        let Some(delta) = self.block.data.get(key_offset..key_offset + non_shared) else {
            self.corruption_error();
            return false;
        };

        self.key.truncate(shared);
        self.key.extend_from_slice(delta);
        self.value_offset = key_offset + non_shared;
        self.value_len = value_len;

        while self.restart_index + 1 < self.block.num_restarts
            && self.block.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }

        true
    }
}

impl InternalIterator for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            self.mark_invalid();
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            self.mark_invalid();
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.block.restart_offset {
            // Keep skipping
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            self.mark_invalid();
            return;
        }

        // Binary search in restart array to find the last restart point
        // with a key < target
        let mut left = 0;
        let mut right = self.block.num_restarts - 1;

        while left < right {
            let mid = (left + right).div_ceil(2);
            let region_offset = self.block.restart_point(mid);

            let Some((shared, non_shared, _, key_offset)) =
                decode_entry(&self.block.data, region_offset, self.block.restart_offset)
            else {
                self.corruption_error();
                return;
            };

            let Some(mid_key) = self
                .block
                .data
                .get(key_offset..key_offset + non_shared)
                .filter(|_| shared == 0)
            else {
                self.corruption_error();
                return;
            };

            if self.comparator.compare(mid_key, target) == Ordering::Less {
                // Key at "mid" is smaller than "target".  Therefore all
                // blocks before "mid" are uninteresting.
                left = mid;
            } else {
                // Key at "mid" is >= "target".  Therefore all blocks at or
                // after "mid" are uninteresting.
                right = mid - 1;
            }
        }

        // Linear search (within restart block) for first key >= target
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());

        // Scan backwards to a restart point before current
        let original = self.current;
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No more entries
                self.mark_invalid();
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);

        // Loop until end of current entry hits the start of original entry
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.block
            .data
            .get(self.value_offset..self.value_offset + self.value_len)
            .unwrap_or_default()
    }

    fn status(&self) -> crate::Result<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
