// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::iter::{BoxedIterator, EmptyIterator, InternalIterator};

/// Opens the data iterator an index entry's value points to
pub type BlockFunction = Box<dyn Fn(&[u8]) -> crate::Result<BoxedIterator> + Send>;

/// Iterates an index whose values point to nested data iterators
///
/// Used for table index block -> data blocks, and for a level's file
/// list -> tables.
pub struct TwoLevelIterator {
    index_iter: BoxedIterator,
    data_iter: Option<BoxedIterator>,
    block_function: BlockFunction,

    /// Index value the current data iterator was created from
    data_block_handle: Vec<u8>,

    /// First error reported by a retired data iterator
    error: Option<crate::Error>,
}

impl TwoLevelIterator {
    pub fn new(index_iter: BoxedIterator, block_function: BlockFunction) -> Self {
        Self {
            index_iter,
            data_iter: None,
            block_function,
            data_block_handle: Vec::new(),
            error: None,
        }
    }

    fn save_error(&mut self, result: crate::Result<()>) {
        if let Err(e) = result {
            if self.error.is_none() {
                self.error = Some(e);
            }
        }
    }

    fn set_data_iter(&mut self, data_iter: Option<BoxedIterator>) {
        if let Some(old) = &self.data_iter {
            let status = old.status();
            self.save_error(status);
        }
        self.data_iter = data_iter;
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.set_data_iter(None);
            return;
        }

        let handle = self.index_iter.value();

        if self.data_iter.is_some() && handle == self.data_block_handle.as_slice() {
            // data_iter is already constructed with this iterator, so
            // no need to change anything
            return;
        }

        let iter = match (self.block_function)(handle) {
            Ok(iter) => iter,
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        };

        self.data_block_handle.clear();
        self.data_block_handle
            .extend_from_slice(self.index_iter.value());
        self.set_data_iter(Some(iter));
    }

    fn data_valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|iter| iter.valid())
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while !self.data_valid() {
            // Move to next block
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(iter) = &mut self.data_iter {
                iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while !self.data_valid() {
            // Move to previous block
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(iter) = &mut self.data_iter {
                iter.seek_to_last();
            }
        }
    }
}

impl InternalIterator for TwoLevelIterator {
    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(iter) = &mut self.data_iter {
            iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.data_iter {
            iter.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.data_iter {
            iter.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        match &self.data_iter {
            Some(iter) => iter.key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match &self.data_iter {
            Some(iter) => iter.value(),
            None => &[],
        }
    }

    fn status(&self) -> crate::Result<()> {
        self.index_iter.status()?;

        if let Some(iter) = &self.data_iter {
            iter.status()?;
        }

        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
