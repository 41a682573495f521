// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    comparator::Comparator,
    iter::{BoxedIterator, EmptyIterator, InternalIterator},
};
use min_max_heap::MinMaxHeap;
use std::{cmp::Ordering, sync::Arc};

type IteratorIndex = usize;

/// Current key of a child iterator
struct HeapItem {
    key: Vec<u8>,
    index: IteratorIndex,
    comparator: Arc<dyn Comparator>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Equal keys resolve to the earlier child going forward,
        // and to the later child going backward
        self.comparator
            .compare(&self.key, &other.key)
            .then_with(|| self.index.cmp(&other.index))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Direction {
    Forward,
    Reverse,
}

/// This iterator can iterate through N iterators simultaneously in order
///
/// This is achieved by advancing the iterator that yields the lowest/highest
/// key, using a simple k-way merge. Entries with equal keys in different
/// children are all yielded.
#[allow(clippy::module_name_repetitions)]
pub struct MergingIterator {
    comparator: Arc<dyn Comparator>,
    children: Vec<BoxedIterator>,

    /// Contains every valid child positioned at its current key
    heap: MinMaxHeap<HeapItem>,

    /// Child holding the current entry
    current: Option<IteratorIndex>,

    direction: Direction,
}

/// Merges `children`, avoiding the merge machinery for zero or one child.
pub fn merging_iterator(
    comparator: Arc<dyn Comparator>,
    mut children: Vec<BoxedIterator>,
) -> BoxedIterator {
    match children.len() {
        0 => Box::new(EmptyIterator::new()),
        1 => children
            .pop()
            .unwrap_or_else(|| Box::new(EmptyIterator::new()) as BoxedIterator),
        _ => Box::new(MergingIterator::new(comparator, children)),
    }
}

impl MergingIterator {
    /// Initializes a new merging iterator
    pub fn new(comparator: Arc<dyn Comparator>, children: Vec<BoxedIterator>) -> Self {
        Self {
            comparator,
            heap: MinMaxHeap::with_capacity(children.len()),
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn push_child(&mut self, index: IteratorIndex) {
        if let Some(child) = self.children.get(index) {
            if child.valid() {
                self.heap.push(HeapItem {
                    key: child.key().to_vec(),
                    index,
                    comparator: self.comparator.clone(),
                });
            }
        }
    }

    fn rebuild_heap(&mut self) {
        self.heap.clear();

        for index in 0..self.children.len() {
            self.push_child(index);
        }

        self.update_current();
    }

    fn update_current(&mut self) {
        let item = match self.direction {
            Direction::Forward => self.heap.peek_min(),
            Direction::Reverse => self.heap.peek_max(),
        };
        self.current = item.map(|item| item.index);
    }

    fn current_child(&self) -> Option<&BoxedIterator> {
        self.current.and_then(|index| self.children.get(index))
    }

    /// Positions all non-current children relative to the current key so
    /// they can be merged in the new `direction`.
    fn switch_direction(&mut self, direction: Direction) {
        let Some(current) = self.current else {
            return;
        };

        let key = self.key().to_vec();

        for (index, child) in self.children.iter_mut().enumerate() {
            if index == current {
                continue;
            }

            child.seek(&key);

            match direction {
                Direction::Forward => {
                    if child.valid()
                        && self.comparator.compare(&key, child.key()) == Ordering::Equal
                    {
                        child.next();
                    }
                }
                Direction::Reverse => {
                    if child.valid() {
                        // Child is at first entry >= key, step back to < key
                        child.prev();
                    } else {
                        // Child has no entries >= key, position at last entry
                        child.seek_to_last();
                    }
                }
            }
        }

        self.direction = direction;
        self.rebuild_heap();
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current_child().is_some_and(|child| child.valid())
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.rebuild_heap();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.rebuild_heap();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.rebuild_heap();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());

        // Ensure that all children are positioned after key().
        // If we are moving in the forward direction, it is already
        // true for all of the non-current children since current is
        // the smallest child and key() == current.key().
        if self.direction != Direction::Forward {
            self.switch_direction(Direction::Forward);
        }

        let Some(item) = self.heap.pop_min() else {
            self.current = None;
            return;
        };
        debug_assert_eq!(Some(item.index), self.current);

        if let Some(child) = self.children.get_mut(item.index) {
            child.next();
        }
        self.push_child(item.index);
        self.update_current();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());

        // Ensure that all children are positioned before key()
        if self.direction != Direction::Reverse {
            self.switch_direction(Direction::Reverse);
        }

        let Some(item) = self.heap.pop_max() else {
            self.current = None;
            return;
        };
        debug_assert_eq!(Some(item.index), self.current);

        if let Some(child) = self.children.get_mut(item.index) {
            child.prev();
        }
        self.push_child(item.index);
        self.update_current();
    }

    fn key(&self) -> &[u8] {
        match self.current_child() {
            Some(child) => child.key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current_child() {
            Some(child) => child.value(),
            None => &[],
        }
    }

    fn status(&self) -> crate::Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}
