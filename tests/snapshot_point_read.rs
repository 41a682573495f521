use levelkv::{Db, Options, ReadOptions, WriteOptions};
use test_log::test;

#[test]
fn snapshot_point_read() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();

    db.put(&w, "foo", "v1")?;
    let s1 = db.snapshot();

    db.put(&w, "foo", "v2")?;
    let s2 = db.snapshot();

    db.delete(&w, "foo")?;
    let s3 = db.snapshot();

    let read = |snapshot: &levelkv::Snapshot| ReadOptions::default().snapshot(snapshot);

    assert_eq!(Some(b"v1".as_slice()), db.get(&read(&s1), "foo")?.as_deref());
    assert_eq!(Some(b"v2".as_slice()), db.get(&read(&s2), "foo")?.as_deref());
    assert!(db.get(&read(&s3), "foo")?.is_none());
    assert!(db.get(&ReadOptions::default(), "foo")?.is_none());

    // Older versions survive a flush while a snapshot needs them
    db.compact_memtable()?;

    assert_eq!(Some(b"v1".as_slice()), db.get(&read(&s1), "foo")?.as_deref());
    assert_eq!(Some(b"v2".as_slice()), db.get(&read(&s2), "foo")?.as_deref());
    assert!(db.get(&read(&s3), "foo")?.is_none());

    db.release_snapshot(s1);
    db.release_snapshot(s2);
    db.release_snapshot(s3);

    Ok(())
}

#[test]
fn snapshot_survives_compaction() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();

    for x in 0..50u32 {
        db.put(&w, format!("{x:04}"), "old")?;
    }

    let snapshot = db.snapshot();

    for x in 0..50u32 {
        db.put(&w, format!("{x:04}"), "new")?;
    }
    db.delete(&w, "0000")?;

    db.compact_range(None, None)?;

    let read = ReadOptions::default().snapshot(&snapshot);

    for x in 0..50u32 {
        assert_eq!(
            Some(b"old".as_slice()),
            db.get(&read, format!("{x:04}"))?.as_deref(),
        );
    }

    let mut iter = db.iter(&read);
    iter.seek_to_first();

    let mut count = 0;

    while iter.valid() {
        assert_eq!(b"old", iter.value());
        count += 1;
        iter.next();
    }

    iter.status()?;
    assert_eq!(50, count);

    drop(snapshot);

    assert!(db.get(&ReadOptions::default(), "0000")?.is_none());
    assert_eq!(
        Some(b"new".as_slice()),
        db.get(&ReadOptions::default(), "0001")?.as_deref(),
    );

    Ok(())
}
