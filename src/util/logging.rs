//! Logger setup: console plus one append-only log file per day.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use log::LevelFilter;

const LOG_FILE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Where and how long log files are kept.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Directory of the log files. Defaults to `<backup root>/logs`.
    pub directory: Option<PathBuf>,

    /// Prefix of the log file.
    pub prefix: String,

    /// Days of log files to keep.
    pub keep_days: u32,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            directory: None,
            prefix: "log-".into(),
            keep_days: 30,
        }
    }
}

/// Writes every record to stderr and, if present, the log file.
struct Tee {
    file: Option<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = &mut self.file {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

/// Path of today's log file in `dir`.
pub fn log_file_path(dir: &Path, prefix: &str, today: NaiveDate) -> PathBuf {
    dir.join(format!("{prefix}{}.log", today.format(LOG_FILE_DATE_FORMAT)))
}

/// Initializes the global logger.
///
/// The level is `level` if given, otherwise taken from `RUST_LOG` and
/// defaults to `info`. With `log_dir` records are appended to today's log file
/// as well; if that file can't be opened only the console is used.
pub fn init(level: Option<LevelFilter>, log_dir: Option<(&Path, &str)>) {
    let mut file_err = None;
    let file = log_dir.and_then(|(dir, prefix)| {
        let path = log_file_path(dir, prefix, Local::now().date_naive());
        let opened = fs::create_dir_all(dir)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => Some(file),
            Err(e) => {
                file_err = Some(format!("{}: {e}", path.display()));
                None
            }
        }
    });

    let mut env_logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        env_logger.filter_level(level);
    }
    env_logger.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    if let Err(e) = env_logger.try_init() {
        eprintln!("Logger initialization failed: {e}");
    }

    if let Some(file_err) = file_err {
        log::warn!(target: "util::logging", "Logging to console only, log file unavailable: {file_err}");
    }
}

/// Deletes log files in `dir` older than `keep_days` days before `today`.
///
/// Returns the removed files. Files not matching `<prefix><date>.log` are
/// left alone.
pub fn prune_logs(
    dir: &Path,
    prefix: &str,
    keep_days: u32,
    today: NaiveDate,
) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let Some(cutoff) = today.checked_sub_days(chrono::Days::new(u64::from(keep_days))) else {
        return Ok(removed);
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(date) = name
            .to_str()
            .and_then(|name| name.strip_prefix(prefix))
            .and_then(|name| name.strip_suffix(".log"))
            .and_then(|date| NaiveDate::parse_from_str(date, LOG_FILE_DATE_FORMAT).ok())
        else {
            continue;
        };

        if date < cutoff {
            fs::remove_file(entry.path())?;
            log::debug!(target: "util::logging", "Removed old log file {}", entry.path().display());
            removed.push(entry.path());
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_name() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            log_file_path(Path::new("/var/log/nc"), "log-", today),
            Path::new("/var/log/nc/log-2024-03-09.log")
        );
    }

    #[test]
    fn prunes_only_old_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        for name in [
            "log-2024-03-09.log",
            "log-2024-03-06.log",
            "log-2024-03-05.log",
            "log-2024-01-01.log",
            "other-2024-01-01.log",
            "log-garbage.log",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let mut removed = prune_logs(dir.path(), "log-", 3, today).unwrap();
        removed.sort();
        assert_eq!(
            removed,
            vec![
                dir.path().join("log-2024-01-01.log"),
                dir.path().join("log-2024-03-05.log"),
            ]
        );
        assert!(dir.path().join("log-2024-03-06.log").exists());
        assert!(dir.path().join("other-2024-01-01.log").exists());
    }

    #[test]
    fn missing_directory_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert!(prune_logs(&dir.path().join("nope"), "log-", 3, today)
            .unwrap()
            .is_empty());
    }
}
