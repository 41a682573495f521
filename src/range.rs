// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Range of user keys, used to query approximate sizes
///
/// Includes `start` but excludes `limit`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Range {
    /// Included in the range
    pub start: Vec<u8>,

    /// Not included in the range
    pub limit: Vec<u8>,
}

impl Range {
    /// Creates a new key range.
    pub fn new<S: AsRef<[u8]>, L: AsRef<[u8]>>(start: S, limit: L) -> Self {
        Self {
            start: start.as_ref().to_vec(),
            limit: limit.as_ref().to_vec(),
        }
    }
}
