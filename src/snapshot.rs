// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::value::SeqNo;
use dashmap::DashMap;
use std::sync::Arc;

/// Keeps track of open snapshots
///
/// The oldest open snapshot bounds which old entries compactions may drop.
#[allow(clippy::module_name_repetitions)]
#[derive(Default)]
pub struct SnapshotList {
    data: DashMap<SeqNo, usize, xxhash_rust::xxh3::Xxh3Builder>,
}

impl SnapshotList {
    pub fn open(&self, seqno: SeqNo) {
        log::trace!("open snapshot {seqno}");

        self.data
            .entry(seqno)
            .and_modify(|x| {
                *x += 1;
            })
            .or_insert(1);
    }

    pub fn close(&self, seqno: SeqNo) {
        log::trace!("close snapshot {seqno}");

        self.data.alter(&seqno, |_, v| v.saturating_sub(1));
        self.data.remove_if(&seqno, |_, v| *v == 0);
    }

    /// Sequence number of the oldest open snapshot
    pub fn oldest(&self) -> Option<SeqNo> {
        self.data.iter().map(|entry| *entry.key()).min()
    }

    /// Number of distinct open snapshot sequence numbers
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A snapshot pins a point-in-time view of the database
///
/// Reads through [`ReadOptions::snapshot`](crate::ReadOptions::snapshot)
/// ignore all writes that happened after the snapshot was taken.
///
/// As long as the snapshot is open, compactions keep the old versions of
/// keys it can see. Thus, snapshots should be released as soon as
/// possible, which happens when the handle is dropped.
///
/// Snapshots do not persist across restarts.
pub struct Snapshot {
    seqno: SeqNo,
    list: Arc<SnapshotList>,
}

impl Snapshot {
    pub(crate) fn new(list: Arc<SnapshotList>, seqno: SeqNo) -> Self {
        list.open(seqno);
        Self { seqno, list }
    }

    /// Sequence number the snapshot reads at
    #[must_use]
    pub fn seqno(&self) -> SeqNo {
        self.seqno
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        Self::new(self.list.clone(), self.seqno)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.close(self.seqno);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot({})", self.seqno)
    }
}
