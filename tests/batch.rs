use levelkv::{Db, Options, ReadOptions, WriteBatch, WriteBatchHandler, WriteOptions};
use std::sync::Arc;
use test_log::test;

#[derive(Default)]
struct Recorder(Vec<String>);

impl WriteBatchHandler for Recorder {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.0.push(format!(
            "Put({}, {})",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value),
        ));
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.push(format!("Delete({})", String::from_utf8_lossy(key)));
    }
}

#[test]
fn batch_simple() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    db.put(&WriteOptions::default(), "old", "value")?;
    let before = db.snapshot().seqno();

    let mut batch = WriteBatch::new();
    batch.put("a", "1").put("b", "2").delete("old");
    assert_eq!(3, batch.count());

    db.write(&WriteOptions::default(), batch)?;

    // One sequence number per operation
    assert_eq!(before + 3, db.snapshot().seqno());

    let r = ReadOptions::default();
    assert_eq!(Some(b"1".as_slice()), db.get(&r, "a")?.as_deref());
    assert_eq!(Some(b"2".as_slice()), db.get(&r, "b")?.as_deref());
    assert!(db.get(&r, "old")?.is_none());

    Ok(())
}

#[test]
fn batch_later_entries_win() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let mut batch = WriteBatch::new();
    batch.put("a", "1");
    batch.delete("a");
    batch.put("b", "1");
    batch.put("b", "2");

    db.write(&WriteOptions::default(), batch)?;

    let r = ReadOptions::default();
    assert!(db.get(&r, "a")?.is_none());
    assert_eq!(Some(b"2".as_slice()), db.get(&r, "b")?.as_deref());

    Ok(())
}

#[test]
fn batch_iterate_and_append() -> levelkv::Result<()> {
    let mut first = WriteBatch::new();
    first.put("foo", "bar");

    let mut second = WriteBatch::new();
    second.delete("box").put("baz", "boo");

    first.append(&second);
    assert_eq!(3, first.count());

    let mut recorder = Recorder::default();
    first.iterate(&mut recorder)?;

    assert_eq!(
        vec!["Put(foo, bar)", "Delete(box)", "Put(baz, boo)"],
        recorder.0,
    );

    Ok(())
}

#[test]
fn batch_recovery() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Db::open(&folder, Options::default().create_if_missing(true))?;

        let mut batch = WriteBatch::new();

        for x in 0..100u32 {
            batch.put(x.to_be_bytes(), x.to_string());
        }

        db.write(&WriteOptions::default().sync(true), batch)?;
    }

    let db = Db::open(&folder, Options::default())?;

    for x in 0..100u32 {
        assert_eq!(
            Some(x.to_string().as_bytes()),
            db.get(&ReadOptions::default(), x.to_be_bytes())?.as_deref(),
        );
    }

    Ok(())
}

#[test]
fn batch_concurrent_writers() -> levelkv::Result<()> {
    const THREADS: u32 = 8;
    const BATCHES: u32 = 200;

    let folder = tempfile::tempdir()?;
    let db = Arc::new(Db::open(
        &folder,
        Options::default().create_if_missing(true),
    )?);

    let handles = (0..THREADS)
        .map(|thread| {
            let db = db.clone();

            std::thread::spawn(move || -> levelkv::Result<()> {
                for x in 0..BATCHES {
                    // Both keys of a batch always carry the same value
                    let mut batch = WriteBatch::new();
                    batch.put(format!("{thread}:a"), x.to_string());
                    batch.put(format!("{thread}:b"), x.to_string());
                    db.write(&WriteOptions::default(), batch)?;
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();

    // Readers never see a half-applied batch
    for _ in 0..50 {
        let snapshot = db.snapshot();
        let read = ReadOptions::default().snapshot(&snapshot);

        for thread in 0..THREADS {
            let a = db.get(&read, format!("{thread}:a"))?;
            let b = db.get(&read, format!("{thread}:b"))?;
            assert_eq!(a, b);
        }
    }

    for handle in handles {
        #[allow(clippy::unwrap_used)]
        handle.join().unwrap()?;
    }

    let r = ReadOptions::default();
    let last = (BATCHES - 1).to_string();

    for thread in 0..THREADS {
        assert_eq!(
            Some(last.as_bytes()),
            db.get(&r, format!("{thread}:a"))?.as_deref(),
        );
        assert_eq!(
            Some(last.as_bytes()),
            db.get(&r, format!("{thread}:b"))?.as_deref(),
        );
    }

    Ok(())
}
