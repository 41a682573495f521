// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    file::table_file_name,
    iter::InternalIterator,
    table::TableBuilder,
    table_cache::TableCache,
    value::InternalKey,
    version::meta::FileMetaData,
    ReadOptions,
};
use std::{fs::File, path::Path};

/// Writes the contents of `iter` into table file `number`.
///
/// Returns `None` if the iterator is empty, in which case no file is
/// left behind. The new table is opened once through the table cache to
/// check it is usable.
pub fn build_table(
    folder: &Path,
    table_cache: &TableCache,
    iter: &mut dyn InternalIterator,
    number: u64,
) -> crate::Result<Option<FileMetaData>> {
    let path = table_file_name(folder, number);

    iter.seek_to_first();

    if !iter.valid() {
        iter.status()?;
        return Ok(None);
    }

    log::debug!("Flushing memtable -> {}", path.display());

    let result = write_table(&path, table_cache, iter, number);

    match result {
        Ok(meta) => {
            log::debug!(
                "Flushed table {number}: {} bytes, {:?} .. {:?}",
                meta.file_size,
                meta.smallest,
                meta.largest,
            );
            Ok(Some(meta))
        }
        Err(e) => {
            log::error!("Flush of table {number} failed: {e:?}");

            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Could not delete {}: {e:?}", path.display());
            }

            Err(e)
        }
    }
}

fn write_table(
    path: &Path,
    table_cache: &TableCache,
    iter: &mut dyn InternalIterator,
    number: u64,
) -> crate::Result<FileMetaData> {
    let mut builder = TableBuilder::new(table_cache.options().clone(), File::create(path)?);

    let smallest = InternalKey::decode_from(iter.key());
    let mut largest = Vec::new();

    while iter.valid() {
        let key = iter.key();

        largest.clear();
        largest.extend_from_slice(key);

        builder.add(key, iter.value())?;
        iter.next();
    }

    iter.status()?;

    // Finish and check for builder errors
    let file_size = builder.finish()?;

    // Verify that the table is usable
    let mut table_iter = table_cache.iter(&ReadOptions::default(), number, file_size);
    table_iter.seek_to_first();
    table_iter.status()?;

    Ok(FileMetaData::new(
        number,
        file_size,
        smallest,
        InternalKey::decode_from(&largest),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comparator::{BytewiseComparator, InternalKeyComparator},
        memtable::MemTable,
        table::TableOptions,
        value::ValueType,
    };
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn build_table_from_memtable() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let table_cache = TableCache::new(folder.path(), TableOptions::new(Arc::new(icmp.clone())), 100);

        let memtable = Arc::new(MemTable::new(icmp));
        memtable.add(1, ValueType::Value, b"b", b"1");
        memtable.add(2, ValueType::Value, b"a", b"2");
        memtable.add(3, ValueType::Deletion, b"c", b"");

        let Some(meta) = build_table(folder.path(), &table_cache, &mut memtable.iter(), 5)? else {
            panic!("table should not be empty");
        };

        assert_eq!(5, meta.number);
        assert_eq!(b"a", meta.smallest.user_key());
        assert_eq!(b"c", meta.largest.user_key());
        assert_eq!(
            meta.file_size,
            std::fs::metadata(table_file_name(folder.path(), 5))?.len()
        );

        Ok(())
    }

    #[test]
    fn build_table_empty() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let table_cache = TableCache::new(folder.path(), TableOptions::new(Arc::new(icmp.clone())), 100);

        let memtable = Arc::new(MemTable::new(icmp));

        assert!(build_table(folder.path(), &table_cache, &mut memtable.iter(), 5)?.is_none());
        assert!(!table_file_name(folder.path(), 5).exists());

        Ok(())
    }
}
