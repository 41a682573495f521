// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    checksum,
    coding::{decode_fixed32, Decode, DecodeError, Encode, EncodeError, VarintReadExt, VarintWriteExt},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

/// Every block is followed by a 1-byte compression tag and a 32-bit masked crc
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Magic number at the very end of every table file
pub const TABLE_MAGIC_NUMBER: u64 = 0xdb47_7524_8b80_fb57;

/// Maximum encoding length of a [`BlockHandle`]
pub const MAX_BLOCK_HANDLE_LEN: usize = 10 + 10;

/// Encoded length of a [`Footer`]
pub const FOOTER_LEN: usize = 2 * MAX_BLOCK_HANDLE_LEN + 8;

/// Points to a block on file
///
/// # Disk representation
///
/// \[offset; varint64] \[size; varint64]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockHandle {
    /// Position of block in file
    pub offset: u64,

    /// Size of block in bytes, excluding the trailer
    pub size: u64,
}

impl BlockHandle {
    /// Creates a new block handle
    #[must_use]
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Decodes a handle from the start of `bytes`.
    pub fn decode_from_slice(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_from(&mut bytes)
    }
}

impl Encode for BlockHandle {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_varint64(self.offset)?;
        writer.write_varint64(self.size)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let offset = reader.read_varint64()?;
        let size = reader.read_varint64()?;
        Ok(Self { offset, size })
    }
}

/// Fixed-size trailer at the end of every table
///
/// # Disk representation
///
/// \[metaindex handle] \[index handle] \[padding up to 40 bytes] \[magic; 8 bytes LE]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Encode for Footer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut buf = Vec::with_capacity(FOOTER_LEN);
        self.metaindex_handle.encode_into(&mut buf)?;
        self.index_handle.encode_into(&mut buf)?;
        buf.resize(2 * MAX_BLOCK_HANDLE_LEN, 0);
        buf.write_u64::<LittleEndian>(TABLE_MAGIC_NUMBER)?;

        writer.write_all(&buf)?;
        Ok(())
    }
}

impl Decode for Footer {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut buf = [0; FOOTER_LEN];
        reader.read_exact(&mut buf)?;

        let (handles, mut magic) = buf.split_at(2 * MAX_BLOCK_HANDLE_LEN);
        if magic.read_u64::<LittleEndian>()? != TABLE_MAGIC_NUMBER {
            return Err(DecodeError::InvalidTag(("TableMagic", 0)));
        }

        let mut handles = handles;
        let metaindex_handle = BlockHandle::decode_from(&mut handles)?;
        let index_handle = BlockHandle::decode_from(&mut handles)?;

        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Read-only file handle supporting positional reads from many threads
pub struct FileHandle {
    file: Mutex<File>,
}

impl FileHandle {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            file: Mutex::new(File::open(path)?),
        })
    }

    /// Reads exactly `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0; len];

        let mut file = self.file.lock().expect("lock is poisoned");
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;

        Ok(buf)
    }
}

/// Reads the block identified by `handle`, verifying its checksum if
/// requested, and returns the uncompressed block contents.
pub fn read_block(
    file: &FileHandle,
    handle: &BlockHandle,
    verify_checksums: bool,
) -> crate::Result<Vec<u8>> {
    let size = usize::try_from(handle.size)
        .map_err(|_| crate::Error::corruption("block handle size out of range"))?;

    let mut data = file
        .read_at(handle.offset, size + BLOCK_TRAILER_SIZE)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                crate::Error::corruption("truncated block read")
            } else {
                crate::Error::Io(e)
            }
        })?;

    let trailer = data.split_off(size);
    let Some((&compression, crc)) = trailer.split_first() else {
        return Err(crate::Error::corruption("truncated block read"));
    };

    if verify_checksums {
        let expected = checksum::unmask(decode_fixed32(crc));
        let actual = checksum::extend(checksum::value(&data), &[compression]);

        if actual != expected {
            return Err(crate::Error::corruption("block checksum mismatch"));
        }
    }

    match compression {
        0 => Ok(data),

        #[cfg(feature = "lz4")]
        4 => Ok(lz4_flex::decompress_size_prepended(&data)?),

        1..=4 => Err(crate::Error::NotSupported(format!(
            "unsupported block compression type {compression}"
        ))),

        _ => Err(crate::Error::corruption("bad block type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn footer_is_fixed_size() -> crate::Result<()> {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(u64::MAX, 7),
            index_handle: BlockHandle::new(1_000, u64::MAX),
        };

        let bytes = footer.encode_into_vec();
        assert_eq!(FOOTER_LEN, bytes.len());
        assert_eq!(
            &TABLE_MAGIC_NUMBER.to_le_bytes(),
            bytes.get(FOOTER_LEN - 8..).expect("should exist")
        );

        let decoded = Footer::decode_from(&mut &bytes[..])?;
        assert_eq!(footer, decoded);

        Ok(())
    }

    #[test]
    fn footer_bad_magic() {
        let mut bytes = Footer::default().encode_into_vec();
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xff;
        }
        assert!(Footer::decode_from(&mut &bytes[..]).is_err());
    }
}
