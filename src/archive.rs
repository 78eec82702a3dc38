//! Compressed archives of backups and their verification.
//!
//! An archive `<name>.tar.gz` holds the top-level entries of a backup
//! directory (`database/`, `data/`, `config/`, ...). The companion file
//! `<name>.tar.gz.sha256` uses the format of `sha256sum`, so
//! `sha256sum -c` can check it as well.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::backends::Database;
use crate::backup::instance::{DATABASE_DIR, REQUIRED_ENTRIES};
use crate::backup::BackupInstance;

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Dump headers written by `mysqldump` and `mariadb-dump`.
const DUMP_HEADERS: [&str; 2] = ["-- MySQL dump", "-- MariaDB dump"];
/// Lines searched for a dump header.
const HEADER_LINES: usize = 5;

/// Outcome of a verification.
///
/// Only errors make a backup invalid, warnings are reported but tolerated.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl VerifyReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Logs every finding, errors with level error.
    pub fn log(&self, subject: &Path) {
        for warning in &self.warnings {
            log::warn!(target: "archive", "{}: {warning}", subject.display());
        }
        for error in &self.errors {
            log::error!(target: "archive", "{}: {error}", subject.display());
        }
        if self.is_valid() {
            log::info!(target: "archive", "{} is valid", subject.display());
        }
    }
}

/// Path of the archive of `name` in `dir`.
pub fn archive_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{ARCHIVE_SUFFIX}"))
}

/// Path of the companion checksum file of `archive`.
pub fn checksum_path(archive: &Path) -> PathBuf {
    let mut path = archive.as_os_str().to_owned();
    path.push(CHECKSUM_SUFFIX);
    path.into()
}

/// Whether `path` looks like an archive rather than a backup directory.
pub fn is_archive(path: &Path) -> bool {
    path.to_string_lossy().ends_with(ARCHIVE_SUFFIX)
}

/// Hex encoded SHA-256 of the file at `path`.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::new(File::open(path)?), &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Writes the archive of `instance` and its checksum file into `out_dir`.
///
/// The archive is written under a temporary name and renamed when complete.
pub fn create(instance: &BackupInstance, out_dir: &Path) -> io::Result<PathBuf> {
    let name = instance.name().to_string();
    let archive = archive_path(out_dir, &name);
    if archive.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", archive.display()),
        ));
    }
    log::info!(target: "archive", "Create archive {}", archive.display());

    fs::create_dir_all(out_dir)?;
    let mut tmp = archive.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = write_archive(instance.path(), &tmp);
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, &archive)?;

    let checksum = sha256_file(&archive)?;
    fs::write(
        checksum_path(&archive),
        format!("{checksum}  {name}{ARCHIVE_SUFFIX}\n"),
    )?;
    log::info!(target: "archive", "Archive written, sha256 {checksum}");

    Ok(archive)
}

fn write_archive(src: &Path, dst: &Path) -> io::Result<()> {
    let file = File::create_new(dst)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let mut entries = fs::read_dir(src)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, &path)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }

    builder.into_inner()?.finish()?.sync_all()
}

/// Unpacks `archive` into `dest`.
pub fn extract(archive: &Path, dest: &Path) -> io::Result<()> {
    log::info!(target: "archive", "Extract {} into {}", archive.display(), dest.display());
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(File::open(archive)?)));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.unpack(dest)
}

/// Remembers whether reading the wrapped reader failed.
///
/// Tells truncated archives apart from a broken dump inside a healthy one.
struct Tracked<R> {
    inner: R,
    failed: bool,
}

impl<R: Read> Read for Tracked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.inner.read(buf);
        if result.is_err() {
            self.failed = true;
        }
        result
    }
}

/// What the dump heuristics found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DumpCheck {
    header: bool,
    table: bool,
}

fn table_pattern(table_prefix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"^CREATE TABLE (IF NOT EXISTS )?`?{}",
        regex::escape(table_prefix)
    ))
}

fn check_dump(reader: impl BufRead, table: &Regex) -> io::Result<DumpCheck> {
    let mut check = DumpCheck::default();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if number < HEADER_LINES && DUMP_HEADERS.iter().any(|header| line.starts_with(header)) {
            check.header = true;
        }
        if !check.table && table.is_match(&line) {
            check.table = true;
        }
    }
    Ok(check)
}

fn report_dump(report: &mut VerifyReport, dump: &str, result: io::Result<DumpCheck>) {
    match result {
        Err(e) => report.warning(format!("Database dump {dump} couldn't be read: {e}")),
        Ok(check) => {
            if !check.header {
                report.warning(format!("Database dump {dump} has no MySQL/MariaDB dump header"));
            }
            if !check.table {
                report.warning(format!("Database dump {dump} creates no Nextcloud table"));
            }
        }
    }
}

fn is_dump(path: &Path) -> bool {
    let name = path.to_string_lossy();
    path.starts_with(DATABASE_DIR) && (name.ends_with(".sql.gz") || name.ends_with(".sql"))
}

fn top_level(path: &Path) -> Option<String> {
    path.components().find_map(|component| match component {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Checks the archive at `path`.
///
/// The archive is decompressed completely, so CRC errors and truncation are
/// found. It has to contain the required top-level entries and match its
/// checksum file if there is one. A missing or suspicious database dump only
/// yields warnings.
pub fn verify_archive(path: &Path, table_prefix: &str) -> VerifyReport {
    let mut report = VerifyReport::default();
    log::info!(target: "archive", "Verify archive {}", path.display());

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            report.error(format!("Unable to open archive: {e}"));
            return report;
        }
    };

    let checksum_file = checksum_path(path);
    if checksum_file.is_file() {
        match (fs::read_to_string(&checksum_file), sha256_file(path)) {
            (Ok(expected), Ok(actual)) => {
                let expected = expected.split_whitespace().next().unwrap_or_default();
                if !expected.eq_ignore_ascii_case(&actual) {
                    report.error(format!("Checksum mismatch: expected {expected}, got {actual}"));
                }
            }
            (Err(e), _) | (_, Err(e)) => report.error(format!("Unable to check checksum: {e}")),
        }
    } else {
        report.warning("No checksum file found");
    }

    let table = match table_pattern(table_prefix) {
        Ok(table) => table,
        Err(e) => {
            report.error(format!("Invalid table prefix {table_prefix}: {e}"));
            return report;
        }
    };

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut entries = BTreeSet::new();
    let mut dump_found = false;

    let walk = (|| -> io::Result<()> {
        for entry in archive.entries()? {
            let entry = entry?;
            let entry_path = entry.path()?.into_owned();
            if let Some(name) = top_level(&entry_path) {
                entries.insert(name);
            }
            if !dump_found && entry.header().entry_type().is_file() && is_dump(&entry_path) {
                dump_found = true;
                let dump = entry_path.display().to_string();
                let mut tracked = Tracked {
                    inner: entry,
                    failed: false,
                };
                let result = if dump.ends_with(".gz") {
                    check_dump(BufReader::new(GzDecoder::new(&mut tracked)), &table)
                } else {
                    check_dump(BufReader::new(&mut tracked), &table)
                };
                if tracked.failed {
                    return Err(result.err().unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::UnexpectedEof, "archive truncated")
                    }));
                }
                report_dump(&mut report, &dump, result);
            }
        }
        Ok(())
    })();

    let walk = walk.and_then(|()| {
        // the gzip trailer with the CRC is only checked at the end of stream
        io::copy(&mut archive.into_inner(), &mut io::sink()).map(|_| ())
    });
    if let Err(e) = walk {
        report.error(format!("Archive is corrupt: {e}"));
        return report;
    }

    for required in REQUIRED_ENTRIES {
        if !entries.contains(required) {
            report.error(format!("Missing top-level entry `{required}`"));
        }
    }
    if !dump_found {
        report.warning("No SQL dump found in archive");
    }

    report
}

/// Checks a backup directory the same way as [verify_archive].
pub fn verify_dir(path: &Path, table_prefix: &str) -> VerifyReport {
    let mut report = VerifyReport::default();
    log::info!(target: "archive", "Verify backup directory {}", path.display());

    if !path.is_dir() {
        report.error("Not a directory");
        return report;
    }
    for required in REQUIRED_ENTRIES {
        if !path.join(required).is_dir() {
            report.error(format!("Missing top-level entry `{required}`"));
        }
    }

    let table = match table_pattern(table_prefix) {
        Ok(table) => table,
        Err(e) => {
            report.error(format!("Invalid table prefix {table_prefix}: {e}"));
            return report;
        }
    };
    match Database::find_dump(path) {
        Err(e) => report.error(format!("Unable to look up the SQL dump: {e}")),
        Ok(None) => report.warning("No SQL dump found in backup"),
        Ok(Some(dump)) => {
            let result = File::open(&dump).and_then(|file| {
                if dump.to_string_lossy().ends_with(".gz") {
                    check_dump(BufReader::new(GzDecoder::new(file)), &table)
                } else {
                    check_dump(BufReader::new(file), &table)
                }
            });
            report_dump(&mut report, &dump.display().to_string(), result);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::NaiveDate;

    use super::*;
    use crate::backup::{BackupKind, BackupName};

    const DUMP: &str = "-- MySQL dump 10.13  Distrib 8.0.36\n--\n-- Host: localhost\n\nCREATE TABLE `oc_accounts` (\n  `uid` varchar(64)\n);\n";

    fn backup_dir(root: &Path, dump: &str) -> BackupInstance {
        let name = BackupName::new(
            "nextcloud",
            NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(3, 0, 0)
                .unwrap(),
            BackupKind::Full,
        );
        let dir = root.join(name.to_string());
        fs::create_dir_all(dir.join("database")).unwrap();
        fs::create_dir_all(dir.join("data/alice/files")).unwrap();
        fs::create_dir_all(dir.join("config")).unwrap();
        fs::write(dir.join("data/alice/files/notes.md"), "hello").unwrap();
        fs::write(dir.join("config/config.php"), "<?php\n").unwrap();

        let mut encoder = GzEncoder::new(
            File::create(dir.join("database/nextcloud.sql.gz")).unwrap(),
            Compression::default(),
        );
        encoder.write_all(dump.as_bytes()).unwrap();
        encoder.finish().unwrap();

        BackupInstance::open(&dir).unwrap()
    }

    #[test]
    fn well_formed_archive_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let instance = backup_dir(dir.path(), DUMP);
        let archive = create(&instance, &dir.path().join("archives")).unwrap();

        assert_eq!(
            archive,
            dir.path().join("archives/nextcloud_20240501_030000_full.tar.gz")
        );
        let checksum = fs::read_to_string(checksum_path(&archive)).unwrap();
        assert!(checksum.ends_with("  nextcloud_20240501_030000_full.tar.gz\n"));

        let report = verify_archive(&archive, "oc_");
        assert_eq!(report, VerifyReport::default());
    }

    #[test]
    fn truncated_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let instance = backup_dir(dir.path(), DUMP);
        let archive = create(&instance, dir.path()).unwrap();
        fs::remove_file(checksum_path(&archive)).unwrap();

        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();

        let report = verify_archive(&archive, "oc_");
        assert!(!report.is_valid());
        assert!(report.errors[0].starts_with("Archive is corrupt"), "{report:?}");
    }

    #[test]
    fn corrupted_archive_is_rejected_by_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let instance = backup_dir(dir.path(), DUMP);
        let archive = create(&instance, dir.path()).unwrap();

        let mut bytes = fs::read(&archive).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&archive, &bytes).unwrap();

        let report = verify_archive(&archive, "oc_");
        assert!(!report.is_valid());
        assert!(report.errors[0].starts_with("Checksum mismatch"), "{report:?}");
    }

    #[test]
    fn missing_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let instance = backup_dir(dir.path(), DUMP);
        fs::remove_dir_all(instance.path().join("config")).unwrap();
        let archive = create(&instance, dir.path()).unwrap();

        let report = verify_archive(&archive, "oc_");
        assert_eq!(report.errors, vec!["Missing top-level entry `config`"]);
    }

    #[test]
    fn unreadable_dump_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let instance = backup_dir(dir.path(), DUMP);
        fs::remove_dir_all(instance.path().join("database")).unwrap();
        fs::write(instance.path().join("database"), "").unwrap();

        let report = verify_dir(instance.path(), "oc_");
        assert!(
            report
                .errors
                .iter()
                .any(|error| error.starts_with("Unable to look up the SQL dump")),
            "{report:?}"
        );
        assert!(report.warnings.is_empty(), "{report:?}");
    }

    #[test]
    fn suspicious_dump_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let instance = backup_dir(dir.path(), "SELECT 1;\n");
        let archive = create(&instance, dir.path()).unwrap();

        let report = verify_archive(&archive, "oc_");
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2, "{report:?}");

        let report = verify_dir(instance.path(), "oc_");
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2, "{report:?}");
    }

    #[test]
    fn extracted_archive_matches_directory() {
        let dir = tempfile::tempdir().unwrap();
        let instance = backup_dir(dir.path(), DUMP);
        let archive = create(&instance, &dir.path().join("archives")).unwrap();

        let target = dir.path().join("extracted");
        extract(&archive, &target).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("data/alice/files/notes.md")).unwrap(),
            "hello"
        );
        assert_eq!(verify_dir(&target, "oc_"), VerifyReport::default());
    }

    #[test]
    fn dump_heuristics() {
        let table = table_pattern("oc_").unwrap();
        let check = check_dump(DUMP.as_bytes(), &table).unwrap();
        assert_eq!(
            check,
            DumpCheck {
                header: true,
                table: true
            }
        );

        let mariadb = "-- MariaDB dump 10.19\nCREATE TABLE IF NOT EXISTS `nc_users` (\n";
        let check = check_dump(mariadb.as_bytes(), &table).unwrap();
        assert!(check.header);
        assert!(!check.table);
        assert!(check_dump(mariadb.as_bytes(), &table_pattern("nc_").unwrap())
            .unwrap()
            .table);
    }
}
