// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use std::sync::Arc;

/// Represents errors that can occur in the database
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Stored data failed a checksum or could not be parsed
    Corruption(String),

    /// Invalid argument or incompatible options
    InvalidArgument(String),

    /// The requested feature (e.g. a compression type) is not supported
    NotSupported(String),

    /// A database or file that was expected to exist does not
    NotFound(String),

    /// A background task failed earlier; the database refuses further writes
    Background(Arc<Error>),

    /// The database directory is locked by another handle
    Locked,

    /// The database is shutting down
    ShuttingDown,
}

impl Error {
    /// Returns `true` if the error signals corrupted on-disk data.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Corruption(_) => true,
            Self::Background(e) => e.is_corruption(),
            _ => false,
        }
    }

    /// Returns `true` if the error signals a missing database or file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Background(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Returns `true` if the error is an I/O error.
    #[must_use]
    pub fn is_io(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Background(e) => e.is_io(),
            _ => false,
        }
    }

    pub(crate) fn corruption<S: Into<String>>(msg: S) -> Self {
        Self::Corruption(msg.into())
    }
}

// NOTE: std::io::Error is not Clone, so it is rebuilt from kind and message.
// A group commit leader hands its outcome to every follower.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Corruption(msg) => Self::Corruption(msg.clone()),
            Self::InvalidArgument(msg) => Self::InvalidArgument(msg.clone()),
            Self::NotSupported(msg) => Self::NotSupported(msg.clone()),
            Self::NotFound(msg) => Self::NotFound(msg.clone()),
            Self::Background(e) => Self::Background(e.clone()),
            Self::Locked => Self::Locked,
            Self::ShuttingDown => Self::ShuttingDown,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LevelKvError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Background(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Corruption(value.to_string())
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        match value {
            EncodeError::Io(e) => Self::Io(e),
        }
    }
}

#[cfg(feature = "lz4")]
impl From<lz4_flex::block::DecompressError> for Error {
    fn from(value: lz4_flex::block::DecompressError) -> Self {
        Self::Corruption(format!("corrupted compressed block contents: {value}"))
    }
}

/// Database result
pub type Result<T> = std::result::Result<T, Error>;
