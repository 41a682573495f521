// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::{checksum, coding::decode_fixed32};
use byteorder::{ByteOrder, LittleEndian};
use std::{io::Read, ops::Range};

/// Receives notifications about dropped, corrupted journal data
pub trait Reporter {
    /// Some corruption was detected; `bytes` is the approximate number
    /// of bytes dropped because of it.
    fn corruption(&mut self, bytes: usize, reason: &str);
}

/// Result of reading one physical record
enum Physical {
    /// Fragment with its raw type and its payload location in the block buffer
    Fragment(Result<RecordType, u8>, Range<usize>),

    Eof,

    /// Invalid physical record, or one that starts before the initial offset
    BadRecord,
}

/// Reads logical records from a journal or manifest file
///
/// Damaged regions are skipped and reported; a truncated record at the
/// end of the file is treated as the end of the file.
pub struct Reader<'a, R: Read> {
    file: R,
    reporter: Option<&'a mut dyn Reporter>,
    checksum: bool,

    /// Current block
    backing: Vec<u8>,

    /// Unread part of `backing`
    buffer: Range<usize>,

    /// Last read returned less than a full block
    eof: bool,

    /// Offset of the last record returned by `read_record`
    last_record_offset: u64,

    /// Offset of the first location past the end of `buffer`
    end_of_buffer_offset: u64,

    /// Offset at which to start looking for the first record
    initial_offset: u64,

    /// Skipping fragments of a record that began before `initial_offset`
    resyncing: bool,
}

impl<'a, R: Read> Reader<'a, R> {
    /// Creates a reader that returns records starting at the first
    /// record beginning at or after `initial_offset`.
    pub fn new(
        file: R,
        reporter: Option<&'a mut dyn Reporter>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Self {
            file,
            reporter,
            checksum,
            backing: vec![0; BLOCK_SIZE],
            buffer: 0..0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Offset of the last record returned by [`Reader::read_record`]
    #[must_use]
    #[cfg(test)]
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Reads the next logical record, or returns `None` at the end of input.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        let mut scratch = Vec::new();
        let mut in_fragmented_record = false;

        // Offset of the logical record being assembled
        let mut prospective_record_offset = 0;

        loop {
            let physical = self.read_physical_record();

            let fragment_len = match &physical {
                Physical::Fragment(_, range) => range.len(),
                _ => 0,
            };

            let physical_record_offset = self
                .end_of_buffer_offset
                .wrapping_sub((self.buffer.len() + HEADER_SIZE + fragment_len) as u64);

            if self.resyncing {
                match physical {
                    Physical::Fragment(Ok(RecordType::Middle), _) => continue,
                    Physical::Fragment(Ok(RecordType::Last), _) => {
                        self.resyncing = false;
                        continue;
                    }
                    _ => {
                        self.resyncing = false;
                    }
                }
            }

            match physical {
                Physical::Fragment(Ok(RecordType::Full), range) => {
                    if in_fragmented_record && !scratch.is_empty() {
                        self.report_corruption(scratch.len(), "partial record without end(1)");
                    }

                    self.last_record_offset = physical_record_offset;
                    return self.backing.get(range).map(<[u8]>::to_vec);
                }
                Physical::Fragment(Ok(RecordType::First), range) => {
                    if in_fragmented_record && !scratch.is_empty() {
                        self.report_corruption(scratch.len(), "partial record without end(2)");
                    }

                    prospective_record_offset = physical_record_offset;
                    scratch.clear();
                    scratch.extend_from_slice(self.backing.get(range).unwrap_or_default());
                    in_fragmented_record = true;
                }
                Physical::Fragment(Ok(RecordType::Middle), range) => {
                    if in_fragmented_record {
                        scratch.extend_from_slice(self.backing.get(range).unwrap_or_default());
                    } else {
                        self.report_corruption(
                            range.len(),
                            "missing start of fragmented record(1)",
                        );
                    }
                }
                Physical::Fragment(Ok(RecordType::Last), range) => {
                    if in_fragmented_record {
                        scratch.extend_from_slice(self.backing.get(range).unwrap_or_default());
                        self.last_record_offset = prospective_record_offset;
                        return Some(scratch);
                    }

                    self.report_corruption(range.len(), "missing start of fragmented record(2)");
                }
                Physical::Eof => {
                    // A writer may have died in the middle of a record;
                    // the partial record is not reported as corruption
                    return None;
                }
                Physical::BadRecord => {
                    if in_fragmented_record {
                        self.report_corruption(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
                Physical::Fragment(Err(record_type), range) => {
                    let dropped = range.len() + if in_fragmented_record { scratch.len() } else { 0 };
                    self.report_corruption(dropped, &format!("unknown record type {record_type}"));
                    in_fragmented_record = false;
                    scratch.clear();
                }
            }
        }
    }

    /// Skips all blocks that are completely before `initial_offset`.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start_location = self.initial_offset - offset_in_block;

        // Don't search a block if we'd be in the trailer
        if offset_in_block > (BLOCK_SIZE - 6) as u64 {
            block_start_location += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start_location;

        if block_start_location > 0 {
            let skipped = std::io::copy(
                &mut (&mut self.file).take(block_start_location),
                &mut std::io::sink(),
            );

            match skipped {
                Ok(n) if n == block_start_location => {}
                Ok(_) => {
                    self.eof = true;
                }
                Err(e) => {
                    #[allow(clippy::cast_possible_truncation)]
                    self.report_drop(block_start_location as usize, &e.to_string());
                    return false;
                }
            }
        }

        true
    }

    /// Reads up to a full block; returns fewer bytes only at the end of the file.
    fn read_block(&mut self) -> std::io::Result<usize> {
        let mut filled = 0;

        while filled < BLOCK_SIZE {
            let Some(buf) = self.backing.get_mut(filled..) else {
                break;
            };

            match self.file.read(buf) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(filled)
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buffer.len() < HEADER_SIZE {
                if self.eof {
                    // A truncated header at the end of the file is caused by
                    // a writer crashing while writing it
                    self.buffer = 0..0;
                    return Physical::Eof;
                }

                // Last read was a full block, so the remainder is a trailer to skip
                self.buffer = 0..0;

                match self.read_block() {
                    Ok(n) => {
                        self.end_of_buffer_offset += n as u64;
                        self.buffer = 0..n;
                        if n < BLOCK_SIZE {
                            self.eof = true;
                        }
                    }
                    Err(e) => {
                        self.report_drop(BLOCK_SIZE, &e.to_string());
                        self.eof = true;
                        return Physical::Eof;
                    }
                }

                continue;
            }

            // Parse the header
            let start = self.buffer.start;
            let Some(header) = self.backing.get(start..start + HEADER_SIZE) else {
                return Physical::Eof;
            };

            let expected_crc = decode_fixed32(header);
            let length = usize::from(LittleEndian::read_u16(&header[4..6]));
            let raw_type = header.get(6).copied().unwrap_or_default();

            if HEADER_SIZE + length > self.buffer.len() {
                let drop_size = self.buffer.len();
                self.buffer = 0..0;

                if !self.eof {
                    self.report_corruption(drop_size, "bad record length");
                    return Physical::BadRecord;
                }

                // The writer died in the middle of writing the record
                return Physical::Eof;
            }

            if raw_type == 0 && length == 0 {
                // Skip zero length records without reporting any drops,
                // they may come from preallocated file regions
                self.buffer = 0..0;
                return Physical::BadRecord;
            }

            let payload = start + HEADER_SIZE..start + HEADER_SIZE + length;

            if self.checksum {
                let actual_crc = checksum::extend(
                    checksum::value(&[raw_type]),
                    self.backing.get(payload.clone()).unwrap_or_default(),
                );

                if checksum::unmask(expected_crc) != actual_crc {
                    // Drop the rest of the buffer since the length itself may
                    // have been corrupted
                    let drop_size = self.buffer.len();
                    self.buffer = 0..0;
                    self.report_corruption(drop_size, "checksum mismatch");
                    return Physical::BadRecord;
                }
            }

            self.buffer.start = payload.end;

            // Skip physical records that started before initial_offset
            if self.end_of_buffer_offset
                < self.initial_offset + (self.buffer.len() + HEADER_SIZE + length) as u64
            {
                return Physical::BadRecord;
            }

            return Physical::Fragment(RecordType::try_from(raw_type), payload);
        }
    }

    fn report_corruption(&mut self, bytes: usize, reason: &str) {
        self.report_drop(bytes, reason);
    }

    fn report_drop(&mut self, bytes: usize, reason: &str) {
        let position = self.end_of_buffer_offset - self.buffer.len() as u64;

        if position >= self.initial_offset + bytes as u64 {
            log::warn!("Journal corruption, dropping {bytes} bytes: {reason}");

            if let Some(reporter) = &mut self.reporter {
                reporter.corruption(bytes, reason);
            }
        }
    }
}
