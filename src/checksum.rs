// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CRC32C checksums as stored on disk
//!
//! Stored checksums are masked: computing the CRC of a string that
//! contains embedded CRCs is problematic, so the stored value is rotated
//! and offset.

const MASK_DELTA: u32 = 0xa282_ead8;

/// Returns a masked representation of `crc`.
#[must_use]
pub fn mask(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Returns the crc whose masked representation is `masked`.
#[must_use]
pub fn unmask(masked: u32) -> u32 {
    masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}

/// CRC32C of `data`.
#[must_use]
pub fn value(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// CRC32C of `init_crc`'s data followed by `data`.
#[must_use]
pub fn extend(init_crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(init_crc, data)
}
