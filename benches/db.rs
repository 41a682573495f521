use criterion::{criterion_group, criterion_main, Criterion};
use levelkv::{BloomFilterPolicy, Db, Options, ReadOptions, WriteBatch, WriteOptions};
use rand::Rng;
use std::sync::Arc;
use tempfile::tempdir;

fn insert(c: &mut Criterion) {
    let item_count = 100_000;

    let mut group = c.benchmark_group("inserts");
    group.sample_size(10);
    group.throughput(criterion::Throughput::Elements(item_count as u64));

    for thread_count in [1_u32, 2, 4] {
        group.bench_function(
            format!("{item_count} inserts ({thread_count} threads)"),
            |b| {
                let folder = tempdir().unwrap();
                let db = Arc::new(
                    Db::open(&folder, Options::default().create_if_missing(true)).unwrap(),
                );

                b.iter(|| {
                    let mut threads = vec![];

                    for _ in 0..thread_count {
                        let db = db.clone();

                        threads.push(std::thread::spawn(move || {
                            for _ in 0..(item_count / thread_count) {
                                let key = nanoid::nanoid!();
                                let value = nanoid::nanoid!();
                                db.put(&WriteOptions::default(), key, value).unwrap();
                            }
                        }));
                    }

                    for thread in threads {
                        thread.join().unwrap();
                    }
                });
            },
        );
    }
}

fn batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch inserts");
    group.sample_size(10);

    for batch_size in [10_u32, 100, 1_000] {
        group.bench_function(format!("batch of {batch_size}"), |b| {
            let folder = tempdir().unwrap();
            let db = Db::open(&folder, Options::default().create_if_missing(true)).unwrap();

            b.iter(|| {
                let mut batch = WriteBatch::new();

                for _ in 0..batch_size {
                    batch.put(nanoid::nanoid!(), nanoid::nanoid!());
                }

                db.write(&WriteOptions::default(), batch).unwrap();
            });
        });
    }
}

fn point_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("point reads");
    group.sample_size(10);

    let max = 100_000_u32;

    for (name, flush) in [("memtable", false), ("tables", true)] {
        let folder = tempdir().unwrap();
        let db = Db::open(
            &folder,
            Options::default()
                .create_if_missing(true)
                .write_buffer_size(64_000_000)
                .filter_policy(Arc::new(BloomFilterPolicy::new(10))),
        )
        .unwrap();

        for x in 0..max {
            db.put(&WriteOptions::default(), x.to_be_bytes(), nanoid::nanoid!())
                .unwrap();
        }

        if flush {
            db.compact_range(None, None).unwrap();
        }

        let mut rng = rand::rng();

        group.bench_function(format!("{name} hit"), |b| {
            b.iter(|| {
                let key = rng.random_range(0..max);
                assert!(db
                    .get(&ReadOptions::default(), key.to_be_bytes())
                    .unwrap()
                    .is_some());
            });
        });

        group.bench_function(format!("{name} miss"), |b| {
            b.iter(|| {
                let key = rng.random_range(max..max * 2);
                assert!(db
                    .get(&ReadOptions::default(), key.to_be_bytes())
                    .unwrap()
                    .is_none());
            });
        });
    }
}

fn scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    group.sample_size(10);

    let item_count = 100_000_u32;

    let folder = tempdir().unwrap();
    let db = Db::open(&folder, Options::default().create_if_missing(true)).unwrap();

    for x in 0..item_count {
        db.put(&WriteOptions::default(), x.to_be_bytes(), nanoid::nanoid!())
            .unwrap();
    }
    db.compact_range(None, None).unwrap();

    group.throughput(criterion::Throughput::Elements(u64::from(item_count)));

    group.bench_function("forward", |b| {
        b.iter(|| {
            let mut iter = db.iter(&ReadOptions::default());
            iter.seek_to_first();

            let mut count = 0;
            while iter.valid() {
                count += 1;
                iter.next();
            }
            assert_eq!(count, item_count);
        });
    });

    group.bench_function("backward", |b| {
        b.iter(|| {
            let mut iter = db.iter(&ReadOptions::default());
            iter.seek_to_last();

            let mut count = 0;
            while iter.valid() {
                count += 1;
                iter.prev();
            }
            assert_eq!(count, item_count);
        });
    });
}

criterion_group!(benches, insert, batch_insert, point_reads, scan);
criterion_main!(benches);
