use levelkv::{Db, Options, ReadOptions, WriteOptions};
use test_log::test;

fn total_table_count(db: &Db) -> usize {
    (0..7)
        .filter_map(|level| db.property(&format!("leveldb.num-files-at-level{level}")))
        .filter_map(|count| count.parse::<usize>().ok())
        .sum()
}

#[test]
fn kv_simple() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();
    let r = ReadOptions::default();

    assert!(db.get(&r, "foo")?.is_none());

    db.put(&w, "foo", "v1")?;
    assert_eq!(Some(b"v1".as_slice()), db.get(&r, "foo")?.as_deref());

    db.put(&w, "foo", "v2")?;
    assert_eq!(Some(b"v2".as_slice()), db.get(&r, "foo")?.as_deref());

    db.put(&w, "bar", "v3")?;
    db.delete(&w, "foo")?;

    assert!(db.get(&r, "foo")?.is_none());
    assert_eq!(Some(b"v3".as_slice()), db.get(&r, "bar")?.as_deref());

    // Deleting a missing key is not an error
    db.delete(&w, "missing")?;

    Ok(())
}

#[test]
fn kv_empty_key_and_value() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    db.put(&WriteOptions::default(), "", "empty key")?;
    db.put(&WriteOptions::default(), "k", "")?;

    assert_eq!(
        Some(b"empty key".as_slice()),
        db.get(&ReadOptions::default(), "")?.as_deref(),
    );
    assert_eq!(
        Some(b"".as_slice()),
        db.get(&ReadOptions::default(), "k")?.as_deref(),
    );

    Ok(())
}

#[test]
fn kv_get_after_flush() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();
    let r = ReadOptions::default();

    db.put(&w, "a", "1")?;
    db.put(&w, "b", "2")?;
    db.compact_memtable()?;

    assert_eq!(1, total_table_count(&db));

    db.delete(&w, "a")?;
    db.put(&w, "b", "3")?;

    // Memtable shadows the table
    assert!(db.get(&r, "a")?.is_none());
    assert_eq!(Some(b"3".as_slice()), db.get(&r, "b")?.as_deref());

    db.compact_memtable()?;

    assert!(db.get(&r, "a")?.is_none());
    assert_eq!(Some(b"3".as_slice()), db.get(&r, "b")?.as_deref());

    Ok(())
}

#[test]
fn kv_large_value() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;

    let big = "x".repeat(200_000);

    {
        let db = Db::open(&folder, Options::default().create_if_missing(true))?;
        db.put(&WriteOptions::default(), "big", &big)?;
        db.put(&WriteOptions::default(), "small", "y")?;

        assert_eq!(
            Some(big.as_bytes()),
            db.get(&ReadOptions::default(), "big")?.as_deref(),
        );
    }

    let db = Db::open(&folder, Options::default())?;

    assert_eq!(
        Some(big.as_bytes()),
        db.get(&ReadOptions::default(), "big")?.as_deref(),
    );
    assert_eq!(
        Some(b"y".as_slice()),
        db.get(&ReadOptions::default(), "small")?.as_deref(),
    );

    Ok(())
}
