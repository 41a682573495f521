// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

pub const CURRENT_FILE: &str = "CURRENT";
pub const TEMP_CURRENT_FILE: &str = "CURRENT.tmp";
pub const LOCK_FILE: &str = "LOCK";
pub const INFO_LOG_FILE: &str = "LOG";
pub const OLD_INFO_LOG_FILE: &str = "LOG.old";
pub const LOST_FOLDER: &str = "lost";

const MANIFEST_PREFIX: &str = "MANIFEST-";

/// Kinds of files living in a database directory
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileType {
    Log,
    DbLock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
}

pub fn log_file_name(folder: &Path, number: u64) -> PathBuf {
    folder.join(format!("{number:06}.log"))
}

pub fn table_file_name(folder: &Path, number: u64) -> PathBuf {
    folder.join(format!("{number:06}.ldb"))
}

/// Legacy table extension, still accepted when opening tables
pub fn sst_table_file_name(folder: &Path, number: u64) -> PathBuf {
    folder.join(format!("{number:06}.sst"))
}

pub fn descriptor_file_name(folder: &Path, number: u64) -> PathBuf {
    folder.join(format!("{MANIFEST_PREFIX}{number:06}"))
}

pub fn temp_file_name(folder: &Path, number: u64) -> PathBuf {
    folder.join(format!("{number:06}.dbtmp"))
}

/// Parses a file name found in a database directory.
///
/// Returns the file number (zero for unnumbered files) and its kind.
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    match name {
        CURRENT_FILE => return Some((0, FileType::Current)),
        TEMP_CURRENT_FILE => return Some((0, FileType::Temp)),
        LOCK_FILE => return Some((0, FileType::DbLock)),
        INFO_LOG_FILE | OLD_INFO_LOG_FILE => return Some((0, FileType::InfoLog)),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix(MANIFEST_PREFIX) {
        let number = parse_number(rest)?;
        return Some((number, FileType::Descriptor));
    }

    let (number, suffix) = name.split_once('.')?;
    let number = parse_number(number)?;

    let file_type = match suffix {
        "log" => FileType::Log,
        "sst" | "ldb" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };

    Some((number, file_type))
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Atomically points `CURRENT` at the manifest with the given number
///
/// The new contents are written to `CURRENT.tmp`, synced and then renamed
/// over `CURRENT`, so readers see either the old or the new name.
pub fn set_current_file(folder: &Path, descriptor_number: u64) -> std::io::Result<()> {
    let contents = format!("{MANIFEST_PREFIX}{descriptor_number:06}\n");

    // Left behind by a crash during a previous swap
    match std::fs::remove_file(folder.join(TEMP_CURRENT_FILE)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    // NOTE: The temp file is deleted on drop if anything fails before
    // it is persisted
    let mut temp_file = tempfile::Builder::new()
        .prefix(CURRENT_FILE)
        .suffix(".tmp")
        .rand_bytes(0)
        .tempfile_in(folder)?;

    temp_file.write_all(contents.as_bytes())?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(folder.join(CURRENT_FILE))?;

    fsync_directory(folder)?;

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}

/// Reads the manifest name stored in `CURRENT`.
pub fn read_current_file(folder: &Path) -> crate::Result<String> {
    let contents = std::fs::read_to_string(folder.join(CURRENT_FILE))?;

    let Some(name) = contents.strip_suffix('\n') else {
        return Err(crate::Error::corruption(
            "CURRENT file does not end with newline",
        ));
    };

    if name.is_empty() {
        return Err(crate::Error::corruption("CURRENT file is empty"));
    }

    Ok(name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn file_name_round_trip() {
        let folder = Path::new("/db");

        for (path, number, file_type) in [
            (log_file_name(folder, 7), 7, FileType::Log),
            (table_file_name(folder, 123_456_789), 123_456_789, FileType::Table),
            (sst_table_file_name(folder, 3), 3, FileType::Table),
            (descriptor_file_name(folder, 1), 1, FileType::Descriptor),
            (temp_file_name(folder, 55), 55, FileType::Temp),
        ] {
            let name = path
                .file_name()
                .and_then(std::ffi::OsStr::to_str)
                .expect("should be utf-8");
            assert_eq!(Some((number, file_type)), parse_file_name(name));
        }
    }

    #[test]
    fn file_name_fixed() {
        assert_eq!(Some((0, FileType::Current)), parse_file_name("CURRENT"));
        assert_eq!(Some((0, FileType::Temp)), parse_file_name("CURRENT.tmp"));
        assert_eq!(Some((0, FileType::DbLock)), parse_file_name("LOCK"));
        assert_eq!(Some((0, FileType::InfoLog)), parse_file_name("LOG"));
        assert_eq!(Some((0, FileType::InfoLog)), parse_file_name("LOG.old"));
        assert_eq!(
            Some((18_446_744_073_709_551_615, FileType::Log)),
            parse_file_name("18446744073709551615.log")
        );
    }

    #[test]
    fn file_name_rejects_garbage() {
        for name in [
            "",
            "foo",
            "foo-dx-100.log",
            ".log",
            "manifest",
            "CURREN",
            "CURRENTX",
            "MANIFES",
            "MANIFEST",
            "MANIFEST-",
            "XMANIFEST-3",
            "MANIFEST-3x",
            "LOC",
            "LOCKx",
            "LO",
            "LOGx",
            "18446744073709551616.log",
            "184467440737095516150.log",
            "100",
            "100.",
            "100.lop",
            "-1.log",
        ] {
            assert_eq!(None, parse_file_name(name), "{name:?} should not parse");
        }
    }

    #[test]
    fn current_file_swap() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;

        set_current_file(folder.path(), 5)?;
        assert_eq!("MANIFEST-000005", read_current_file(folder.path())?);

        set_current_file(folder.path(), 12)?;
        assert_eq!("MANIFEST-000012", read_current_file(folder.path())?);
        assert!(!folder.path().join(TEMP_CURRENT_FILE).try_exists()?);

        // Stale temp file from an interrupted swap
        std::fs::write(folder.path().join(TEMP_CURRENT_FILE), "MANIFEST-000099")?;
        set_current_file(folder.path(), 13)?;
        assert_eq!("MANIFEST-000013", read_current_file(folder.path())?);
        assert!(!folder.path().join(TEMP_CURRENT_FILE).try_exists()?);

        std::fs::write(folder.path().join(CURRENT_FILE), "MANIFEST-000012")?;
        assert!(matches!(
            read_current_file(folder.path()),
            Err(crate::Error::Corruption(_))
        ));

        Ok(())
    }
}
