use levelkv::{Db, DbIterator, Options, ReadOptions, WriteOptions};
use test_log::test;

fn collect_forward(iter: &mut DbIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut items = vec![];
    iter.seek_to_first();

    while iter.valid() {
        items.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }

    items
}

fn collect_backward(iter: &mut DbIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut items = vec![];
    iter.seek_to_last();

    while iter.valid() {
        items.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.prev();
    }

    items
}

fn kv(key: &str, value: &str) -> (Vec<u8>, Vec<u8>) {
    (key.as_bytes().to_vec(), value.as_bytes().to_vec())
}

#[test]
fn db_iter_empty() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let mut iter = db.iter(&ReadOptions::default());

    iter.seek_to_first();
    assert!(!iter.valid());

    iter.seek_to_last();
    assert!(!iter.valid());

    iter.seek("foo");
    assert!(!iter.valid());

    iter.status()
}

#[test]
fn db_iter_forward_backward() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();

    db.put(&w, "b", "vb")?;
    db.put(&w, "a", "va")?;
    db.put(&w, "c", "vc")?;
    db.put(&w, "d", "vd")?;
    db.delete(&w, "d")?;
    db.put(&w, "a", "va2")?;

    let expected = vec![kv("a", "va2"), kv("b", "vb"), kv("c", "vc")];

    let mut iter = db.iter(&ReadOptions::default());
    assert_eq!(expected, collect_forward(&mut iter));

    let mut reversed = expected;
    reversed.reverse();
    assert_eq!(reversed, collect_backward(&mut iter));

    iter.status()
}

#[test]
fn db_iter_across_tables_and_memtable() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();

    for x in 0..100u32 {
        db.put(&w, format!("key{x:03}"), format!("old{x}"))?;
    }
    db.compact_memtable()?;

    for x in (0..100u32).step_by(2) {
        db.put(&w, format!("key{x:03}"), format!("new{x}"))?;
    }
    db.compact_memtable()?;

    for x in (0..100u32).step_by(3) {
        db.delete(&w, format!("key{x:03}"))?;
    }

    let expected = (0..100u32)
        .filter(|x| x % 3 != 0)
        .map(|x| {
            let value = if x % 2 == 0 {
                format!("new{x}")
            } else {
                format!("old{x}")
            };
            (format!("key{x:03}").into_bytes(), value.into_bytes())
        })
        .collect::<Vec<_>>();

    let mut iter = db.iter(&ReadOptions::default());
    assert_eq!(expected, collect_forward(&mut iter));

    let mut reversed = expected;
    reversed.reverse();
    assert_eq!(reversed, collect_backward(&mut iter));

    iter.status()
}

#[test]
fn db_iter_seek() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();

    db.put(&w, "a", "1")?;
    db.put(&w, "c", "3")?;
    db.put(&w, "e", "5")?;

    let mut iter = db.iter(&ReadOptions::default());

    iter.seek("c");
    assert!(iter.valid());
    assert_eq!(b"c", iter.key());

    iter.seek("b");
    assert!(iter.valid());
    assert_eq!(b"c", iter.key());
    assert_eq!(b"3", iter.value());

    iter.seek("");
    assert!(iter.valid());
    assert_eq!(b"a", iter.key());

    iter.seek("f");
    assert!(!iter.valid());

    iter.status()
}

#[test]
fn db_iter_switch_direction() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();

    db.put(&w, "a", "va")?;
    db.put(&w, "b", "vb")?;
    db.put(&w, "c", "vc")?;

    let mut iter = db.iter(&ReadOptions::default());

    iter.seek("b");
    assert_eq!(b"b", iter.key());

    iter.prev();
    assert!(iter.valid());
    assert_eq!(b"a", iter.key());
    assert_eq!(b"va", iter.value());

    iter.next();
    assert!(iter.valid());
    assert_eq!(b"b", iter.key());

    iter.next();
    assert!(iter.valid());
    assert_eq!(b"c", iter.key());

    iter.prev();
    assert!(iter.valid());
    assert_eq!(b"b", iter.key());
    assert_eq!(b"vb", iter.value());

    iter.prev();
    iter.prev();
    assert!(!iter.valid());

    iter.seek_to_last();
    assert_eq!(b"c", iter.key());

    iter.next();
    assert!(!iter.valid());

    iter.status()
}

#[test]
fn db_iter_ignores_later_writes() -> levelkv::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Db::open(&folder, Options::default().create_if_missing(true))?;

    let w = WriteOptions::default();

    db.put(&w, "a", "va")?;
    db.put(&w, "b", "vb")?;

    let mut iter = db.iter(&ReadOptions::default());

    db.put(&w, "a", "changed")?;
    db.put(&w, "c", "vc")?;
    db.delete(&w, "b")?;

    assert_eq!(vec![kv("a", "va"), kv("b", "vb")], collect_forward(&mut iter));

    iter.status()
}
