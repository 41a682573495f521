// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    block_builder::BlockBuilder,
    filter_block::FilterBlockBuilder,
    format::{BlockHandle, Footer},
    TableOptions,
};
use crate::{checksum, coding::Encode, CompressionType};
use byteorder::{ByteOrder, LittleEndian};
use std::{
    fs::File,
    io::{BufWriter, Write},
};

/// Serializes sorted entries into a table file
///
/// Keys must be added in strictly increasing comparator order.
#[allow(clippy::module_name_repetitions)]
pub struct TableBuilder {
    opts: TableOptions,

    file: BufWriter<File>,
    offset: u64,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,

    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,

    /// Set when a data block was just flushed
    ///
    /// The index entry for it is emitted when the next key is seen,
    /// so that a short separator between the blocks can be used.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl TableBuilder {
    /// Starts building a table into `file`.
    pub fn new(opts: TableOptions, file: File) -> Self {
        let mut filter_block = opts
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(policy.clone()));

        if let Some(filter_block) = &mut filter_block {
            filter_block.start_block(0);
        }

        Self {
            data_block: BlockBuilder::new(opts.comparator.clone(), opts.block_restart_interval),
            index_block: BlockBuilder::new(opts.comparator.clone(), 1),
            filter_block,
            opts,
            file: BufWriter::with_capacity(128_000, file),
            offset: 0,
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    /// Adds an entry.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        debug_assert!(!self.closed);
        debug_assert!(
            self.num_entries == 0
                || self.opts.comparator.compare(key, &self.last_key)
                    == std::cmp::Ordering::Greater
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());

            self.opts
                .comparator
                .find_shortest_separator(&mut self.last_key, key);

            let handle = self.pending_handle.encode_into_vec();
            self.index_block.add(&self.last_key, &handle);
            self.pending_index_entry = false;
        }

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.opts.block_size {
            self.flush()?;
        }

        Ok(())
    }

    /// Writes the buffered data block, if any.
    ///
    /// Mostly useful to ensure two adjacent entries never live in
    /// the same data block.
    pub fn flush(&mut self) -> crate::Result<()> {
        debug_assert!(!self.closed);

        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        self.pending_handle = Self::write_block(
            &mut self.file,
            &mut self.offset,
            &mut self.data_block,
            self.opts.compression,
        )?;
        self.pending_index_entry = true;

        self.file.flush()?;

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.start_block(self.offset);
        }

        Ok(())
    }

    fn write_block(
        file: &mut BufWriter<File>,
        offset: &mut u64,
        block: &mut BlockBuilder,
        compression: CompressionType,
    ) -> crate::Result<BlockHandle> {
        let raw = block.finish();

        let handle = match compression {
            CompressionType::None => Self::write_raw_block(file, offset, raw, CompressionType::None)?,

            #[cfg(feature = "lz4")]
            CompressionType::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(raw);

                // Keep the block uncompressed if compression saved less than 12.5%
                if compressed.len() < raw.len() - (raw.len() / 8) {
                    Self::write_raw_block(file, offset, &compressed, CompressionType::Lz4)?
                } else {
                    Self::write_raw_block(file, offset, raw, CompressionType::None)?
                }
            }
        };

        block.reset();

        Ok(handle)
    }

    fn write_raw_block(
        file: &mut BufWriter<File>,
        offset: &mut u64,
        contents: &[u8],
        compression: CompressionType,
    ) -> crate::Result<BlockHandle> {
        let handle = BlockHandle::new(*offset, contents.len() as u64);

        file.write_all(contents)?;

        let tag = compression.tag();
        let crc = checksum::extend(checksum::value(contents), &[tag]);

        let mut trailer = [0; super::format::BLOCK_TRAILER_SIZE];
        trailer[0] = tag;
        LittleEndian::write_u32(&mut trailer[1..], checksum::mask(crc));
        file.write_all(&trailer)?;

        *offset += (contents.len() + trailer.len()) as u64;

        Ok(handle)
    }

    /// Finishes the table, syncs the file and returns the final file size.
    pub fn finish(&mut self) -> crate::Result<u64> {
        self.flush()?;
        debug_assert!(!self.closed);
        self.closed = true;

        // Write filter block
        let filter_handle = match &mut self.filter_block {
            Some(filter_block) => Some(Self::write_raw_block(
                &mut self.file,
                &mut self.offset,
                filter_block.finish(),
                CompressionType::None,
            )?),
            None => None,
        };

        // Write metaindex block
        let mut metaindex_block = BlockBuilder::new(self.opts.comparator.clone(), 1);
        if let (Some(handle), Some(policy)) = (filter_handle, &self.opts.filter_policy) {
            let key = format!("filter.{}", policy.name());
            metaindex_block.add(key.as_bytes(), &handle.encode_into_vec());
        }
        let metaindex_handle = Self::write_block(
            &mut self.file,
            &mut self.offset,
            &mut metaindex_block,
            self.opts.compression,
        )?;

        // Write index block
        if self.pending_index_entry {
            self.opts
                .comparator
                .find_short_successor(&mut self.last_key);

            let handle = self.pending_handle.encode_into_vec();
            self.index_block.add(&self.last_key, &handle);
            self.pending_index_entry = false;
        }
        let index_handle = Self::write_block(
            &mut self.file,
            &mut self.offset,
            &mut self.index_block,
            self.opts.compression,
        )?;

        // Write footer
        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let footer = footer.encode_into_vec();
        self.file.write_all(&footer)?;
        self.offset += footer.len() as u64;

        self.file.flush()?;
        self.file.get_mut().sync_all()?;

        log::trace!(
            "Finished table with {} entries, {} bytes",
            self.num_entries,
            self.offset
        );

        Ok(self.offset)
    }

    /// Stops building; the caller deletes the partially written file.
    pub fn abandon(&mut self) {
        debug_assert!(!self.closed);
        self.closed = true;
    }

    /// Number of entries added so far
    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Size of the file generated so far
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.offset
    }
}
