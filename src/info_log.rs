// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::file::{INFO_LOG_FILE, OLD_INFO_LOG_FILE};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Gets the unix timestamp as a duration
pub fn unix_timestamp() -> Duration {
    let now = SystemTime::now();

    // NOTE: Unwrap is trivial
    #[allow(clippy::unwrap_used)]
    now.duration_since(UNIX_EPOCH).unwrap()
}

/// Human-readable operational log kept next to the data files (`LOG`)
///
/// Every line is mirrored to the `log` facade. Writing the file is best
/// effort and never fails a database operation.
pub struct InfoLog {
    file: Mutex<Option<BufWriter<File>>>,
}

impl InfoLog {
    /// Opens `LOG`, rotating a previous one to `LOG.old`.
    pub fn open(folder: &Path) -> Self {
        let path = folder.join(INFO_LOG_FILE);

        if path.try_exists().unwrap_or(false) {
            if let Err(e) = std::fs::rename(&path, folder.join(OLD_INFO_LOG_FILE)) {
                log::warn!("Could not rotate info log: {e:?}");
            }
        }

        let file = match File::create(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                log::warn!("Could not create info log at {}: {e:?}", path.display());
                None
            }
        };

        Self {
            file: Mutex::new(file),
        }
    }

    pub fn log(&self, args: std::fmt::Arguments<'_>) {
        log::info!("{args}");

        let mut lock = self.file.lock().expect("lock is poisoned");

        if let Some(file) = lock.as_mut() {
            let ts = unix_timestamp();

            let result = writeln!(file, "{}.{:06} {args}", ts.as_secs(), ts.subsec_micros())
                .and_then(|()| file.flush());

            if let Err(e) = result {
                log::warn!("Failed to write info log: {e:?}");
            }
        }
    }
}
