// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Bidirectional cursor over sorted key-value entries
///
/// Blocks, tables, memtables, levels and their merges all expose this
/// capability set. Keys are ordered by the comparator the cursor was
/// built with. `key` and `value` may only be called while `valid()`.
pub trait InternalIterator: Send {
    /// Returns `true` if positioned at an entry.
    fn valid(&self) -> bool;

    /// Positions at the first entry.
    fn seek_to_first(&mut self);

    /// Positions at the last entry.
    fn seek_to_last(&mut self);

    /// Positions at the first entry with a key `>= target`.
    fn seek(&mut self, target: &[u8]);

    /// Moves to the next entry.
    fn next(&mut self);

    /// Moves to the previous entry.
    fn prev(&mut self);

    /// Key of the current entry.
    fn key(&self) -> &[u8];

    /// Value of the current entry.
    fn value(&self) -> &[u8];

    /// First error encountered, if any.
    fn status(&self) -> crate::Result<()>;
}

pub type BoxedIterator = Box<dyn InternalIterator>;

/// Iterator without entries, optionally carrying an error
#[derive(Default)]
pub struct EmptyIterator {
    error: Option<crate::Error>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(error: crate::Error) -> Self {
        Self { error: Some(error) }
    }
}

impl InternalIterator for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }

    fn seek_to_first(&mut self) {}

    fn seek_to_last(&mut self) {}

    fn seek(&mut self, _target: &[u8]) {}

    fn next(&mut self) {
        debug_assert!(false, "next on an invalid iterator");
    }

    fn prev(&mut self) {
        debug_assert!(false, "prev on an invalid iterator");
    }

    fn key(&self) -> &[u8] {
        &[]
    }

    fn value(&self) -> &[u8] {
        &[]
    }

    fn status(&self) -> crate::Result<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::InternalIterator;

    /// Iterator over an in-memory, bytewise sorted list of entries
    pub struct VecIterator {
        items: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecIterator {
        pub fn new(mut items: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            items.sort();
            Self { items, pos: None }
        }

        fn current(&self) -> Option<&(Vec<u8>, Vec<u8>)> {
            self.pos.and_then(|pos| self.items.get(pos))
        }
    }

    impl InternalIterator for VecIterator {
        fn valid(&self) -> bool {
            self.current().is_some()
        }

        fn seek_to_first(&mut self) {
            self.pos = Some(0);
        }

        fn seek_to_last(&mut self) {
            self.pos = self.items.len().checked_sub(1);
        }

        fn seek(&mut self, target: &[u8]) {
            self.pos = Some(self.items.partition_point(|(key, _)| key.as_slice() < target));
        }

        fn next(&mut self) {
            self.pos = self.pos.map(|pos| pos + 1);
        }

        fn prev(&mut self) {
            self.pos = self.pos.and_then(|pos| pos.checked_sub(1));
        }

        fn key(&self) -> &[u8] {
            match self.current() {
                Some((key, _)) => key,
                None => &[],
            }
        }

        fn value(&self) -> &[u8] {
            match self.current() {
                Some((_, value)) => value,
                None => &[],
            }
        }

        fn status(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    /// Collects all entries by walking forward from the start.
    pub fn collect_forward(iter: &mut dyn InternalIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut items = vec![];
        iter.seek_to_first();
        while iter.valid() {
            items.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        items
    }

    /// Collects all entries by walking backward from the end.
    pub fn collect_backward(iter: &mut dyn InternalIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut items = vec![];
        iter.seek_to_last();
        while iter.valid() {
            items.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        items
    }
}
