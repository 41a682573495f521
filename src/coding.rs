// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Integer and slice encodings shared by every on-disk format
//!
//! Fixed-width integers are little-endian. Varints use 7 bits per byte,
//! least significant group first, with the high bit set on every byte but
//! the last.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{Read, Write};

/// Maximum encoded length of a 32-bit varint
pub const MAX_VARINT32_LEN: usize = 5;

/// Maximum encoded length of a 64-bit varint
pub const MAX_VARINT64_LEN: usize = 10;

/// Error during encoding
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

/// Error during decoding
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Invalid enum tag
    InvalidTag((&'static str, u8)),

    /// A varint ran past its maximum length or the input ended early
    InvalidVarint,

    /// A length-prefixed slice claims more bytes than are available
    InvalidLength,

    /// Invalid UTF-8 in a string field
    Utf8(std::str::Utf8Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncodeError: {self:?}")
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodeError: {self:?}")
    }
}

impl std::error::Error for EncodeError {}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

/// Trait to encode stuff
pub trait Encode {
    /// Encodes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Encodes into vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];

        #[allow(clippy::expect_used)]
        self.encode_into(&mut v).expect("cannot fail");

        v
    }
}

/// Trait to decode stuff
pub trait Decode {
    /// Decodes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Appends a little-endian `u32`.
pub fn put_fixed32(dst: &mut Vec<u8>, value: u32) {
    let mut buf = [0; 4];
    LittleEndian::write_u32(&mut buf, value);
    dst.extend_from_slice(&buf);
}

/// Appends a little-endian `u64`.
pub fn put_fixed64(dst: &mut Vec<u8>, value: u64) {
    let mut buf = [0; 8];
    LittleEndian::write_u64(&mut buf, value);
    dst.extend_from_slice(&buf);
}

/// Reads a little-endian `u32` from the start of `src`.
///
/// # Panics
///
/// Panics if `src` is shorter than 4 bytes.
#[must_use]
pub fn decode_fixed32(src: &[u8]) -> u32 {
    LittleEndian::read_u32(src)
}

/// Reads a little-endian `u64` from the start of `src`.
///
/// # Panics
///
/// Panics if `src` is shorter than 8 bytes.
#[must_use]
pub fn decode_fixed64(src: &[u8]) -> u64 {
    LittleEndian::read_u64(src)
}

/// Appends a varint-encoded `u32`.
pub fn put_varint32(dst: &mut Vec<u8>, value: u32) {
    put_varint64(dst, u64::from(value));
}

/// Appends a varint-encoded `u64`.
pub fn put_varint64(dst: &mut Vec<u8>, mut value: u64) {
    // NOTE: Truncation is okay and actually needed
    #[allow(clippy::cast_possible_truncation)]
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }

    #[allow(clippy::cast_possible_truncation)]
    dst.push(value as u8);
}

/// Appends a varint length prefix followed by the bytes.
pub fn put_length_prefixed_slice(dst: &mut Vec<u8>, value: &[u8]) {
    // NOTE: Truncation is okay, keys and values are limited to u32
    #[allow(clippy::cast_possible_truncation)]
    put_varint32(dst, value.len() as u32);
    dst.extend_from_slice(value);
}

/// Decodes a varint32 from the start of `src`.
///
/// Returns the value and the number of bytes consumed.
#[must_use]
pub fn decode_varint32(src: &[u8]) -> Option<(u32, usize)> {
    let mut result = 0u32;

    for (idx, byte) in src.iter().take(MAX_VARINT32_LEN).enumerate() {
        let shift = idx * 7;
        result |= u32::from(byte & 0x7f) << shift;

        if byte & 0x80 == 0 {
            return Some((result, idx + 1));
        }
    }

    None
}

/// Decodes a varint64 from the start of `src`.
///
/// Returns the value and the number of bytes consumed.
#[must_use]
pub fn decode_varint64(src: &[u8]) -> Option<(u64, usize)> {
    let mut result = 0u64;

    for (idx, byte) in src.iter().take(MAX_VARINT64_LEN).enumerate() {
        let shift = idx * 7;
        result |= u64::from(byte & 0x7f) << shift;

        if byte & 0x80 == 0 {
            return Some((result, idx + 1));
        }
    }

    None
}

/// Decodes a length-prefixed slice from the start of `src`.
///
/// Returns the slice and the total number of bytes consumed.
#[must_use]
pub fn decode_length_prefixed_slice(src: &[u8]) -> Option<(&[u8], usize)> {
    let (len, n) = decode_varint32(src)?;
    let len = len as usize;
    let slice = src.get(n..n + len)?;
    Some((slice, n + len))
}

/// Extension trait to read varints from a reader
pub trait VarintReadExt: Read {
    /// Reads a varint-encoded `u64`.
    fn read_varint64(&mut self) -> Result<u64, DecodeError> {
        let mut result = 0u64;

        for idx in 0..MAX_VARINT64_LEN {
            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7f) << (idx * 7);

            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }

        Err(DecodeError::InvalidVarint)
    }
}

impl<R: Read + ?Sized> VarintReadExt for R {}

/// Extension trait to write varints into a writer
pub trait VarintWriteExt: Write {
    /// Writes a varint-encoded `u64`.
    fn write_varint64(&mut self, value: u64) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(MAX_VARINT64_LEN);
        put_varint64(&mut buf, value);
        self.write_all(&buf)
    }
}

impl<W: Write + ?Sized> VarintWriteExt for W {}
