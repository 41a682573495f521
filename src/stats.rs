// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::version::NUM_LEVELS;
use std::{fmt::Write, time::Duration};

/// Per-level compaction counters
///
/// Counters of level N describe the work that produced files of level N.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    /// Time spent in compactions (in µs)
    pub(crate) micros: u64,

    pub(crate) bytes_read: u64,

    pub(crate) bytes_written: u64,
}

impl CompactionStats {
    pub fn add(&mut self, elapsed: Duration, bytes_read: u64, bytes_written: u64) {
        self.micros += u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

#[allow(clippy::cast_precision_loss)]
fn mebibytes(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

/// Formats the compaction table reported by the `leveldb.stats` property.
///
/// Only levels that hold files or have done work are listed.
#[allow(clippy::cast_precision_loss)]
pub fn format_stats(
    stats: &[CompactionStats; NUM_LEVELS],
    level_files: &[usize; NUM_LEVELS],
    level_bytes: &[u64; NUM_LEVELS],
) -> String {
    let mut out = String::from(
        "                               Compactions\n\
         Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
         --------------------------------------------------\n",
    );

    for (level, stat) in stats.iter().enumerate() {
        let files = level_files[level];

        if stat.micros == 0 && files == 0 {
            continue;
        }

        // NOTE: Writing into a String cannot fail
        let _ = writeln!(
            out,
            "{level:3} {files:8} {:8.0} {:9.0} {:8.0} {:9.0}",
            mebibytes(level_bytes[level]),
            stat.micros as f64 / 1e6,
            mebibytes(stat.bytes_read),
            mebibytes(stat.bytes_written),
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn stats_only_active_levels() {
        let mut stats = [CompactionStats::default(); NUM_LEVELS];
        stats[1].add(Duration::from_secs(2), 3 << 20, 2 << 20);

        let mut files = [0; NUM_LEVELS];
        files[0] = 2;
        files[1] = 1;

        let mut bytes = [0; NUM_LEVELS];
        bytes[1] = 2 << 20;

        let table = format_stats(&stats, &files, &bytes);
        let rows = table.lines().skip(3).collect::<Vec<_>>();

        assert_eq!(2, rows.len());
        assert_eq!("  0        2        0         0        0         0", rows[0]);
        assert_eq!("  1        1        2         2        3         2", rows[1]);
    }
}
