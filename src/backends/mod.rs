//! Backend modules for performing individual backup tasks.
//!
//! Currently the following backends are implemented:
//!
//! - [Database]: Compressed dump of the Nextcloud MySQL/MariaDB database.
//! - [Files]: Full or hard-link incremental copy of the data and app directories.
//! - [Config]: Backup of Nextcloud's config directory.
//! - [Redis]: Copy of the Redis dump file.

pub mod config;
pub mod database;
pub mod files;
pub mod redis;

use std::path::Path;
use std::time::Duration;

pub use config::Config;
pub use database::{Database, DatabaseSettings};
pub use files::{CopyMethod, Files};
pub use redis::Redis;

use crate::nextcloud::Nextcloud;

/// Where a backend writes to.
#[derive(Debug, Clone, Copy)]
pub struct Destination<'a> {
    /// Directory of the backup being written.
    pub root: &'a Path,
    /// Directory of the base backup for incremental backups.
    pub base: Option<&'a Path>,
    /// Time limit for external commands.
    pub timeout: Option<Duration>,
}

/// Generic backup backend.
pub trait Backup {
    /// Error that may happen on backup.
    type Error;

    /// Name of the backend, used as step key.
    fn name(&self) -> &'static str;

    /// Backups data managed by the implementation into `dest`.
    ///
    /// # Dry Run
    ///
    /// On a dry run (`dry_run=true`) no files are altered.
    /// This does include folders and other special files.
    ///
    /// Instead sanity checks are performed to determine if a "real" backup
    /// would succeed under the present conditions.
    fn backup(
        &self,
        nextcloud: &Nextcloud,
        dest: &Destination<'_>,
        dry_run: bool,
    ) -> Result<(), Self::Error>;
}

/// Counterpart of [Backup], writing a backup back into the installation.
pub trait Restore: Backup {
    /// Restores from the backup directory `source`.
    fn restore(
        &self,
        nextcloud: &Nextcloud,
        source: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), Self::Error>;
}
