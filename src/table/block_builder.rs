// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{put_fixed32, put_varint32},
    comparator::Comparator,
};
use std::sync::Arc;

/// Builds a block of prefix-compressed entries
///
/// Keys are stored relative to the previous key; every
/// `restart_interval` entries the full key is stored again and its
/// offset recorded as a restart point.
///
/// # Disk representation
///
/// entry: \[shared; varint32] \[non_shared; varint32] \[value_len; varint32]
/// \[key delta; non_shared bytes] \[value]
///
/// trailer: \[restart offsets; u32 LE each] \[restart count; u32 LE]
pub struct BlockBuilder {
    comparator: Arc<dyn Comparator>,
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,

    /// Number of entries emitted since the last restart
    counter: usize,

    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(comparator: Arc<dyn Comparator>, restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);

        Self {
            comparator,
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    /// Resets the contents as if the builder was just constructed.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// Appends an entry.
    ///
    /// `key` must be larger than any previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.restart_interval);
        debug_assert!(
            self.is_empty()
                || self.comparator.compare(key, &self.last_key) == std::cmp::Ordering::Greater
        );

        let mut shared = 0;

        if self.counter < self.restart_interval {
            // See how much sharing to do with previous key
            shared = self
                .last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count();
        } else {
            // Restart compression
            // NOTE: Truncation is okay, blocks are far smaller than 4 GiB
            #[allow(clippy::cast_possible_truncation)]
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }

        let non_shared = key.len() - shared;

        // NOTE: Truncation is okay, keys and values are limited to u32
        #[allow(clippy::cast_possible_truncation)]
        let header = [shared as u32, non_shared as u32, value.len() as u32];

        for n in header {
            put_varint32(&mut self.buffer, n);
        }

        let delta = key.get(shared..).unwrap_or_default();
        self.buffer.extend_from_slice(delta);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(delta);
        debug_assert_eq!(key, &self.last_key[..]);

        self.counter += 1;
    }

    /// Finishes building the block and returns its contents.
    ///
    /// The slice stays valid until [`BlockBuilder::reset`] is called.
    pub fn finish(&mut self) -> &[u8] {
        if !self.finished {
            for restart in &self.restarts {
                put_fixed32(&mut self.buffer, *restart);
            }

            // NOTE: Truncation is okay, there are far less than 4 billion restarts
            #[allow(clippy::cast_possible_truncation)]
            put_fixed32(&mut self.buffer, self.restarts.len() as u32);

            self.finished = true;
        }

        &self.buffer
    }

    /// Estimated size of the block being built.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len()
            + self.restarts.len() * std::mem::size_of::<u32>()
            + std::mem::size_of::<u32>()
    }

    /// Returns `true` if no entries have been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
