//! Exclusive lock for mutating runs.
//!
//! The lock file records the PID and start time of its holder. It is written
//! to a temporary file first and hard linked into place, so it appears
//! atomically and is never seen half written. It is removed when the
//! [RunLock] is dropped.
//!
//! A lock left behind by a crashed run is stale. Only the holder of the
//! takeover guard (`<lock>.takeover`) may remove a stale lock, and it checks
//! again under the guard that the lock is still the stale one.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, TimeDelta};
use derive_more::{Display, Error};

/// Hours after which a lock is considered stale regardless of its PID.
const STALE_AFTER_HOURS: i64 = 24;
/// Age after which a lock file that can't be parsed is considered stale.
const UNREADABLE_STALE_AFTER: Duration = Duration::from_secs(10 * 60);
/// Age after which a takeover guard is left over from a crash.
const GUARD_STALE_AFTER: Duration = Duration::from_secs(60);
const GUARD_WAIT: Duration = Duration::from_millis(50);
const GUARD_ATTEMPTS: u32 = 100;

/// Distinguishes temporary files of concurrent attempts within one process.
static ATTEMPT: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Display, Error)]
pub enum LockError {
    /// Another live run holds the lock.
    #[display("Another run (pid {pid}, started {since}) holds the lock {}", path.display())]
    Held {
        path: PathBuf,
        pid: u32,
        since: String,
    },
    /// The lock file exists but has no holder record, remove it if no run is active.
    #[display("Lock {} exists without a holder record", path.display())]
    Unreadable { path: PathBuf },
    /// Another run is taking over a stale lock right now.
    #[display("Another run is taking over the stale lock {}", path.display())]
    Busy { path: PathBuf },
    /// The lock file couldn't be created or inspected.
    #[display("Unable to lock {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Held lock, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

#[derive(Debug)]
struct Holder {
    pid: u32,
    since: DateTime<Local>,
}

/// `<path>.<suffix>` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut sibling = path.as_os_str().to_owned();
    sibling.push(format!(".{suffix}"));
    sibling.into()
}

fn unique_suffix(kind: &str) -> String {
    format!(
        "{kind}.{}.{}",
        std::process::id(),
        ATTEMPT.fetch_add(1, Ordering::Relaxed)
    )
}

fn age(meta: &fs::Metadata) -> Duration {
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

impl RunLock {
    /// Acquires the lock at `path`, taking over a stale lock.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        let record = sibling(path, &unique_suffix("tmp"));
        let content = format!("{}\n{}\n", std::process::id(), Local::now().to_rfc3339());
        fs::write(&record, content).map_err(io_err)?;

        let result = Self::link(path, &record);
        if let Err(e) = fs::remove_file(&record) {
            log::warn!(target: "util::lock", "Unable to remove {}: {e}", record.display());
        }
        result
    }

    fn link(path: &Path, record: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        for _ in 0..2 {
            match fs::hard_link(record, path) {
                Ok(()) => {
                    log::debug!(target: "util::lock", "Acquired lock {}", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => remove_stale(path)?,
                Err(e) => return Err(io_err(e)),
            }
        }

        Err(io_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock was re-created concurrently",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!(target: "util::lock", "Unable to release lock {}: {e}", self.path.display());
        } else {
            log::debug!(target: "util::lock", "Released lock {}", self.path.display());
        }
    }
}

/// Content of the lock at `path`, [None] if there is none.
fn read_lock(path: &Path) -> Result<Option<(String, fs::Metadata)>, LockError> {
    let read = fs::metadata(path).and_then(|meta| Ok((fs::read_to_string(path)?, meta)));
    match read {
        Ok(lock) => Ok(Some(lock)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Fails unless the lock with `content` is stale.
fn check_stale(path: &Path, content: &str, meta: &fs::Metadata) -> Result<(), LockError> {
    match parse_holder(content) {
        Some(holder) if !holder.is_stale(Local::now()) => Err(LockError::Held {
            path: path.to_path_buf(),
            pid: holder.pid,
            since: holder.since.to_rfc3339(),
        }),
        None if age(meta) < UNREADABLE_STALE_AFTER => Err(LockError::Unreadable {
            path: path.to_path_buf(),
        }),
        _ => Ok(()),
    }
}

/// Removes the lock at `path` if it is stale. Fails if it is held.
fn remove_stale(path: &Path) -> Result<(), LockError> {
    let io_err = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };

    let Some((content, meta)) = read_lock(path)? else {
        return Ok(());
    };
    check_stale(path, &content, &meta)?;

    let _guard = TakeoverGuard::acquire(path)?;
    // another run may have replaced the stale lock before we got the guard
    match read_lock(path)? {
        Some((current, _)) if current == content => {}
        _ => return Ok(()),
    }

    log::warn!(
        target: "util::lock",
        "Removing stale lock {}: {}",
        path.display(),
        content.trim().replace('\n', " ")
    );
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_err(e)),
        _ => Ok(()),
    }
}

/// Permission to remove a stale lock, held by at most one run.
struct TakeoverGuard {
    path: PathBuf,
}

impl TakeoverGuard {
    fn acquire(lock: &Path) -> Result<Self, LockError> {
        let path = sibling(lock, "takeover");

        for _ in 0..GUARD_ATTEMPTS {
            let held = match File::create_new(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => fs::metadata(&path),
                Err(source) => return Err(LockError::Io { path, source }),
            };
            match held {
                Ok(meta) if age(&meta) > GUARD_STALE_AFTER => {
                    log::warn!(target: "util::lock", "Removing stale takeover guard {}", path.display());
                    let _ = fs::remove_file(&path);
                }
                Ok(_) => thread::sleep(GUARD_WAIT),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }

        Err(LockError::Busy {
            path: lock.to_path_buf(),
        })
    }
}

impl Drop for TakeoverGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn parse_holder(content: &str) -> Option<Holder> {
    let mut lines = content.lines();
    let pid = lines.next()?.trim().parse().ok()?;
    let since = DateTime::parse_from_rfc3339(lines.next()?.trim())
        .ok()?
        .with_timezone(&Local);

    Some(Holder { pid, since })
}

impl Holder {
    fn is_stale(&self, now: DateTime<Local>) -> bool {
        let alive = Path::new("/proc").join(self.pid.to_string()).exists();
        !alive || now.signed_duration_since(self.since) > TimeDelta::hours(STALE_AFTER_HOURS)
    }
}
