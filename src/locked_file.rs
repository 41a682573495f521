// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{fs::File, path::Path};

/// Exclusive advisory lock on a database directory's `LOCK` file
///
/// The lock is released when the guard is dropped.
pub struct LockedFileGuard(File);

impl Drop for LockedFileGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.unlock() {
            log::warn!("Could not release LOCK file: {e:?}");
        }
    }
}

impl LockedFileGuard {
    /// Creates the lock file if needed and locks it without blocking.
    pub fn acquire(path: &Path) -> crate::Result<Self> {
        log::trace!("Locking {}", path.display());

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock().map_err(|e| match e {
            std::fs::TryLockError::WouldBlock => {
                log::debug!("{} is held by another handle", path.display());
                crate::Error::Locked
            }
            std::fs::TryLockError::Error(e) => crate::Error::Io(e),
        })?;

        Ok(Self(file))
    }
}
