// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Record-framed log, used for the write-ahead journal and the manifest
//!
//! The file is a sequence of 32 KiB blocks. Each block holds physical
//! records:
//!
//! \[masked crc32c; u32 LE] \[length; u16 LE] \[type; 1 byte] \[payload]
//!
//! The checksum covers the type byte and the payload. A logical record
//! that does not fit into the remainder of a block is split into
//! `First`, `Middle`* and `Last` fragments. A block trailer too small to
//! hold a header is zero-filled and skipped by readers.

pub mod reader;
pub mod writer;

pub use reader::{Reader, Reporter};
pub use writer::Writer;

/// Size of a journal block
pub const BLOCK_SIZE: usize = 32_768;

/// Header is checksum (4 bytes), length (2 bytes), type (1 byte)
pub const HEADER_SIZE: usize = 4 + 2 + 1;

/// Physical record type
///
/// Type 0 is reserved for preallocated, zeroed file regions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
    /// Complete logical record
    Full = 1,

    /// First fragment of a logical record
    First = 2,

    /// Inner fragment of a logical record
    Middle = 3,

    /// Last fragment of a logical record
    Last = 4,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Full),
            2 => Ok(Self::First),
            3 => Ok(Self::Middle),
            4 => Ok(Self::Last),
            _ => Err(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs::File, path::Path};
    use test_log::test;

    #[derive(Default)]
    struct ReportCollector {
        dropped_bytes: usize,
        message: String,
    }

    impl Reporter for ReportCollector {
        fn corruption(&mut self, bytes: usize, reason: &str) {
            self.dropped_bytes += bytes;
            self.message.push_str(reason);
        }
    }

    fn big_string(partial: &str, n: usize) -> Vec<u8> {
        partial.bytes().cycle().take(n).collect()
    }

    fn write_records(path: &Path, records: &[&[u8]]) -> crate::Result<()> {
        let mut writer = Writer::new(File::create(path)?);
        for record in records {
            writer.add_record(record)?;
        }
        writer.sync()?;
        Ok(())
    }

    fn read_all(bytes: &[u8], reporter: &mut ReportCollector, initial_offset: u64) -> Vec<Vec<u8>> {
        let mut reader = Reader::new(bytes, Some(reporter), true, initial_offset);
        let mut records = vec![];
        while let Some(record) = reader.read_record() {
            records.push(record);
        }
        records
    }

    #[test]
    fn journal_empty() -> crate::Result<()> {
        let mut report = ReportCollector::default();
        assert!(read_all(&[], &mut report, 0).is_empty());
        assert_eq!(0, report.dropped_bytes);
        Ok(())
    }

    #[test]
    fn journal_read_write() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        write_records(&path, &[b"foo", b"bar", b"", b"xxxx"])?;

        let mut report = ReportCollector::default();
        let records = read_all(&std::fs::read(&path)?, &mut report, 0);

        assert_eq!(
            vec![b"foo".to_vec(), b"bar".to_vec(), vec![], b"xxxx".to_vec()],
            records
        );
        assert_eq!(0, report.dropped_bytes);

        Ok(())
    }

    #[test]
    fn journal_many_blocks() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        let records = (0..20_000).map(|i| i.to_string()).collect::<Vec<_>>();
        let refs = records.iter().map(String::as_bytes).collect::<Vec<_>>();
        write_records(&path, &refs)?;

        let bytes = std::fs::read(&path)?;
        assert!(bytes.len() > 3 * BLOCK_SIZE);

        let mut report = ReportCollector::default();
        let read = read_all(&bytes, &mut report, 0);

        assert_eq!(
            refs.iter().map(|r| r.to_vec()).collect::<Vec<_>>(),
            read
        );

        Ok(())
    }

    #[test]
    fn journal_fragmentation() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        let medium = big_string("medium", 50_000);
        let large = big_string("large", 100_000);
        write_records(&path, &[b"small", &medium, &large])?;

        let mut report = ReportCollector::default();
        let read = read_all(&std::fs::read(&path)?, &mut report, 0);

        assert_eq!(vec![b"small".to_vec(), medium, large], read);
        assert_eq!(0, report.dropped_bytes);

        Ok(())
    }

    #[test]
    fn journal_marginal_trailer() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        // Make a trailer that is exactly the same length as an empty record
        let n = BLOCK_SIZE - 2 * HEADER_SIZE;
        let first = big_string("foo", n);
        write_records(&path, &[&first, b"", b"bar"])?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(BLOCK_SIZE + HEADER_SIZE + 3, bytes.len());

        let mut report = ReportCollector::default();
        let read = read_all(&bytes, &mut report, 0);
        assert_eq!(vec![first, vec![], b"bar".to_vec()], read);

        Ok(())
    }

    #[test]
    fn journal_short_trailer_is_padded() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        // Leaves 4 bytes in the first block, too small for a header
        let n = BLOCK_SIZE - 2 * HEADER_SIZE + 3;
        let first = big_string("foo", n);
        write_records(&path, &[&first, b"bar"])?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(BLOCK_SIZE + HEADER_SIZE + 3, bytes.len());

        let mut report = ReportCollector::default();
        let read = read_all(&bytes, &mut report, 0);
        assert_eq!(vec![first, b"bar".to_vec()], read);
        assert_eq!(0, report.dropped_bytes);

        Ok(())
    }

    #[test]
    fn journal_checksum_mismatch() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        write_records(&path, &[b"foooooo"])?;

        let mut bytes = std::fs::read(&path)?;
        if let Some(byte) = bytes.get_mut(HEADER_SIZE + 1) {
            *byte ^= 0x01;
        }

        let mut report = ReportCollector::default();
        assert!(read_all(&bytes, &mut report, 0).is_empty());
        assert_eq!(HEADER_SIZE + 7, report.dropped_bytes);
        assert!(report.message.contains("checksum mismatch"));

        Ok(())
    }

    #[test]
    fn journal_truncated_trailing_record_is_ignored() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        write_records(&path, &[b"foo", b"bar"])?;

        let mut bytes = std::fs::read(&path)?;
        bytes.truncate(bytes.len() - 1);

        let mut report = ReportCollector::default();
        let read = read_all(&bytes, &mut report, 0);

        // Truncated last record is treated as end of file, not corruption
        assert_eq!(vec![b"foo".to_vec()], read);
        assert_eq!(0, report.dropped_bytes);

        Ok(())
    }

    #[test]
    fn journal_bad_length_drops_block() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        let payload_size = BLOCK_SIZE - HEADER_SIZE;
        let first = big_string("bar", payload_size);
        write_records(&path, &[&first, b"foo"])?;

        // Least significant byte of the length field of the first record
        let mut bytes = std::fs::read(&path)?;
        if let Some(byte) = bytes.get_mut(4) {
            *byte = byte.wrapping_add(1);
        }

        let mut report = ReportCollector::default();
        let read = read_all(&bytes, &mut report, 0);

        assert_eq!(vec![b"foo".to_vec()], read);
        assert_eq!(BLOCK_SIZE, report.dropped_bytes);
        assert!(report.message.contains("bad record length"));

        Ok(())
    }

    #[test]
    fn journal_initial_offset() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let path = folder.path().join("000001.log");

        let first = big_string("a", 10_000);
        let second = big_string("b", 10_000);
        let third = big_string("c", 50_000);
        write_records(&path, &[&first, &second, &third])?;

        let bytes = std::fs::read(&path)?;

        let second_offset = (HEADER_SIZE + 10_000) as u64;

        let mut report = ReportCollector::default();
        let mut reader = Reader::new(&bytes[..], Some(&mut report), true, second_offset);

        assert_eq!(Some(second), reader.read_record());
        assert_eq!(second_offset, reader.last_record_offset());
        assert_eq!(Some(third), reader.read_record());
        assert_eq!(None, reader.read_record());
        drop(reader);

        assert_eq!(0, report.dropped_bytes);

        // Starting in the middle of a fragmented record skips it entirely
        let mut report = ReportCollector::default();
        let read = read_all(&bytes, &mut report, second_offset + 20_000);
        assert!(read.is_empty());

        Ok(())
    }
}
