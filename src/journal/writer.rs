// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::checksum;
use byteorder::{ByteOrder, LittleEndian};
use std::{
    fs::File,
    io::{BufWriter, Write},
};

const BLOCK_PADDING: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Appends logical records to a journal or manifest file
pub struct Writer {
    file: BufWriter<File>,

    /// Current offset in the block
    block_offset: usize,
}

impl Writer {
    /// Creates a writer appending to an empty file.
    pub fn new(file: File) -> Self {
        Self::with_offset(file, 0)
    }

    /// Creates a writer appending to a file that already contains
    /// `dest_length` bytes, positioned at its end.
    pub fn with_offset(file: File, dest_length: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let block_offset = (dest_length % BLOCK_SIZE as u64) as usize;

        Self {
            file: BufWriter::new(file),
            block_offset,
        }
    }

    /// Appends a record, fragmenting it across blocks if needed.
    ///
    /// The record is handed to the OS before returning, but not synced.
    pub fn add_record(&mut self, record: &[u8]) -> crate::Result<()> {
        let mut left = record;
        let mut begin = true;

        // An empty record still emits a single zero-length fragment
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            if leftover < HEADER_SIZE {
                // Switch to a new block, filling the trailer with zeroes
                if leftover > 0 {
                    self.file
                        .write_all(BLOCK_PADDING.get(..leftover).unwrap_or_default())?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.len().min(available);
            let end = fragment_length == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            let (fragment, rest) = left.split_at(fragment_length);
            self.emit_physical_record(record_type, fragment)?;

            left = rest;
            begin = false;

            if left.is_empty() {
                break;
            }
        }

        self.file.flush()?;

        Ok(())
    }

    fn emit_physical_record(&mut self, record_type: RecordType, payload: &[u8]) -> crate::Result<()> {
        debug_assert!(payload.len() <= 0xFFFF);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let type_byte = record_type as u8;
        let crc = checksum::extend(checksum::value(&[type_byte]), payload);

        // NOTE: Fragments never exceed a block, so the length fits into u16
        #[allow(clippy::cast_possible_truncation)]
        let length = payload.len() as u16;

        let mut header = [0; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[..4], checksum::mask(crc));
        LittleEndian::write_u16(&mut header[4..6], length);
        header[6] = type_byte;

        self.file.write_all(&header)?;
        self.file.write_all(payload)?;

        self.block_offset += HEADER_SIZE + payload.len();

        Ok(())
    }

    /// Hands buffered data to the OS.
    pub fn flush(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flushes buffered data and syncs the file to disk.
    pub fn sync(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}
