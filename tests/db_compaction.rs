use levelkv::{Db, Options, Range, ReadOptions, WriteOptions};
use test_log::test;

const ITEM_COUNT: u32 = 1_000;

fn key(x: u32) -> String {
    format!("key{x:06}")
}

fn value(x: u32) -> String {
    let mut value = format!("{x}:");
    value.extend(std::iter::repeat_n('x', 1_000));
    value
}

fn files_at_level(db: &Db, level: usize) -> usize {
    db.property(&format!("leveldb.num-files-at-level{level}"))
        .and_then(|count| count.parse().ok())
        .unwrap_or_default()
}

fn total_files(db: &Db) -> usize {
    (0..7).map(|level| files_at_level(db, level)).sum()
}

fn small_buffer_options() -> Options {
    Options::default()
        .create_if_missing(true)
        .write_buffer_size(64 * 1_024)
}

/// One table file as listed by `leveldb.sstables`
#[derive(Debug)]
struct TableListing {
    size: u64,

    /// (user key, seqno)
    smallest: (String, u64),
    largest: (String, u64),
}

fn parse_internal_key(s: &str) -> Option<(String, u64)> {
    // "user_key":seqno:type
    let (_, rest) = s.split_once('"')?;
    let (user_key, rest) = rest.split_once('"')?;
    let seqno = rest.strip_prefix(':')?.split(':').next()?.parse().ok()?;
    Some((user_key.to_owned(), seqno))
}

fn parse_sstables(listing: &str) -> Vec<Vec<TableListing>> {
    let mut levels: Vec<Vec<TableListing>> = vec![];

    for line in listing.lines() {
        if line.starts_with("--- level ") {
            levels.push(vec![]);
            continue;
        }

        // number:size[smallest .. largest]
        let line = line.trim();
        let parsed = line.split_once(':').and_then(|(_, rest)| {
            let (size, rest) = rest.split_once('[')?;
            let (smallest, largest) = rest.strip_suffix(']')?.split_once(" .. ")?;

            Some(TableListing {
                size: size.parse().ok()?,
                smallest: parse_internal_key(smallest)?,
                largest: parse_internal_key(largest)?,
            })
        });

        assert!(parsed.is_some(), "unparsable table line: {line:?}");

        if let (Some(level), Some(table)) = (levels.last_mut(), parsed) {
            level.push(table);
        }
    }

    levels
}

/// Orders internal keys: user key ascending, then sequence number descending
fn internal_key_less(a: &(String, u64), b: &(String, u64)) -> bool {
    a.0 < b.0 || (a.0 == b.0 && a.1 > b.1)
}

fn max_bytes_for_level(level: usize) -> u64 {
    let mut result = 10 * 1_024 * 1_024;
    for _ in 1..level {
        result *= 10;
    }
    result
}

#[test]
fn compaction_level_shape_after_settling() -> levelkv::Result<()> {
    const TOTAL_BYTES: u32 = 10 * 1_024 * 1_024;
    const KEY_SPACE: u32 = 5_000;

    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, small_buffer_options())?;

    let value_len = u32::try_from(value(0).len()).unwrap_or(u32::MAX);
    let writes = TOTAL_BYTES / value_len;

    // Later writes overwrite earlier keys
    for x in 0..writes {
        db.put(&WriteOptions::default(), key(x % KEY_SPACE), value(x))?;
    }

    db.wait_for_background_work()?;

    for k in 0..KEY_SPACE {
        let last_write = (0..writes).rev().find(|x| x % KEY_SPACE == k);
        let expected = last_write.map(value);

        assert_eq!(
            expected.as_deref().map(str::as_bytes),
            db.get(&ReadOptions::default(), key(k))?.as_deref(),
        );
    }

    // Reads may have scheduled seek compactions
    db.wait_for_background_work()?;

    // Level 0 is below the slowdown trigger
    assert!(files_at_level(&db, 0) <= 8);

    let listing = db.property("leveldb.sstables").unwrap_or_default();
    let levels = parse_sstables(&listing);
    assert_eq!(7, levels.len());

    let level_files = levels.iter().map(Vec::len).collect::<Vec<_>>();
    let expected_files = (0..7).map(|level| files_at_level(&db, level)).collect::<Vec<_>>();
    assert_eq!(expected_files, level_files);

    for (level, tables) in levels.iter().enumerate().skip(1) {
        // Files of a level are sorted and do not overlap
        for pair in tables.windows(2) {
            if let [prev, next] = pair {
                assert!(
                    internal_key_less(&prev.largest, &next.smallest),
                    "level {level} overlaps: {prev:?} {next:?}",
                );
            }
        }

        for table in tables {
            assert!(!internal_key_less(&table.largest, &table.smallest));
        }

        // The last level has no size target
        if level < 6 {
            let level_bytes = tables.iter().map(|t| t.size).sum::<u64>();
            assert!(
                level_bytes <= max_bytes_for_level(level),
                "level {level} holds {level_bytes} bytes",
            );
        }
    }

    assert!(db.max_next_level_overlapping_bytes() <= 20 * 1_024 * 1_024);

    Ok(())
}

#[test]
fn compaction_compact_range() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, small_buffer_options())?;

    for x in 0..ITEM_COUNT {
        db.put(&WriteOptions::default(), key(x), value(x))?;
    }

    for x in (0..ITEM_COUNT).step_by(2) {
        db.delete(&WriteOptions::default(), key(x))?;
    }

    db.compact_range(None, None)?;

    assert_eq!(0, files_at_level(&db, 0));
    assert!(total_files(&db) > 0);

    let mut iter = db.iter(&ReadOptions::default());
    iter.seek_to_first();

    let mut expected = (0..ITEM_COUNT).filter(|x| x % 2 == 1);

    while iter.valid() {
        let x = expected.next();
        assert!(x.is_some());

        let x = x.unwrap_or_default();
        assert_eq!(key(x).as_bytes(), iter.key());
        assert_eq!(value(x).as_bytes(), iter.value());

        iter.next();
    }

    iter.status()?;
    assert!(expected.next().is_none());

    Ok(())
}

#[test]
fn compaction_deletes_everything() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, small_buffer_options())?;

    for x in 0..ITEM_COUNT {
        db.put(&WriteOptions::default(), key(x), value(x))?;
    }
    db.compact_range(None, None)?;
    assert!(total_files(&db) > 0);

    for x in 0..ITEM_COUNT {
        db.delete(&WriteOptions::default(), key(x))?;
    }
    db.compact_range(None, None)?;

    // Tombstones were dropped at the bottom
    assert_eq!(0, total_files(&db));

    let mut iter = db.iter(&ReadOptions::default());
    iter.seek_to_first();
    assert!(!iter.valid());

    iter.status()
}

#[test]
fn compaction_survives_reopen() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Db::open(&folder, small_buffer_options())?;

        for x in 0..ITEM_COUNT {
            db.put(&WriteOptions::default(), key(x), value(x))?;
        }

        db.compact_range(None, None)?;

        for x in 0..10 {
            db.put(&WriteOptions::default(), key(x), "overwritten")?;
        }
    }

    let db = Db::open(&folder, Options::default())?;

    for x in 0..ITEM_COUNT {
        let expected = if x < 10 {
            "overwritten".to_owned()
        } else {
            value(x)
        };

        assert_eq!(
            Some(expected.as_bytes()),
            db.get(&ReadOptions::default(), key(x))?.as_deref(),
        );
    }

    Ok(())
}

#[test]
fn compaction_approximate_sizes() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(
        &folder,
        small_buffer_options().compression(levelkv::CompressionType::None),
    )?;

    for x in 0..ITEM_COUNT {
        db.put(&WriteOptions::default(), key(x), value(x))?;
    }

    db.compact_range(None, None)?;

    let sizes = db.approximate_sizes(&[
        Range::new("", "zzz"),
        Range::new(key(0), key(ITEM_COUNT / 2)),
        Range::new("zzz", "zzzz"),
    ]);

    let total = u64::from(ITEM_COUNT) * 1_000;

    let [all, half, none] = sizes.as_slice() else {
        panic!("expected three sizes");
    };

    assert!(*all >= total, "{all} < {total}");
    assert!(*all <= total * 2, "{all} > {}", total * 2);

    assert!(*half >= total / 3, "{half} too small");
    assert!(*half <= total * 2 / 3, "{half} too large");

    assert_eq!(0, *none);

    Ok(())
}

#[test]
fn compaction_properties() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, small_buffer_options())?;

    assert!(db.property("leveldb.nope").is_none());
    assert!(db.property("rocksdb.stats").is_none());
    assert!(db.property("leveldb.num-files-at-level7").is_none());
    assert_eq!(Some("0".to_owned()), db.property("leveldb.num-files-at-level0"));

    for x in 0..ITEM_COUNT {
        db.put(&WriteOptions::default(), key(x), value(x))?;
    }
    db.compact_range(None, None)?;

    let stats = db.property("leveldb.stats").unwrap_or_default();
    assert!(stats.contains("Compactions"));

    let sstables = db.property("leveldb.sstables").unwrap_or_default();
    assert!(sstables.contains("--- level 0 ---"));

    let memory = db
        .property("leveldb.approximate-memory-usage")
        .and_then(|usage| usage.parse::<u64>().ok());
    assert!(memory.is_some());

    Ok(())
}
