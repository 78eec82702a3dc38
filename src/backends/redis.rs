//! Implements backup of the Redis dump file using [Redis].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Backup, Destination, Restore};
use crate::backup::instance::REDIS_DIR;
use crate::nextcloud::Nextcloud;

const DUMP_FILE: &str = "dump.rdb";

/// The [Redis] backend copies the file Redis persists its data to.
///
/// Redis keeps only caches and file locks for Nextcloud, so the copy is taken
/// as is without asking Redis for a fresh save.
#[derive(Debug, Clone)]
pub struct Redis {
    dump: PathBuf,
}

impl Redis {
    pub fn new(dump: PathBuf) -> Self {
        Self { dump }
    }
}

impl Backup for Redis {
    type Error = io::Error;

    fn name(&self) -> &'static str {
        "redis"
    }

    fn backup(
        &self,
        _nextcloud: &Nextcloud,
        dest: &Destination<'_>,
        dry_run: bool,
    ) -> Result<(), Self::Error> {
        log::info!(target: "backend::redis", "Create backup of Redis dump: {}", self.dump.display());
        let metadata = fs::metadata(&self.dump)?;
        if dry_run {
            return Ok(());
        }

        let target = dest.root.join(REDIS_DIR);
        fs::create_dir_all(&target)?;
        fs::copy(&self.dump, target.join(DUMP_FILE))?;
        log::info!(target: "backend::redis", "Finished backup of Redis dump ({} bytes)", metadata.len());

        Ok(())
    }
}

impl Restore for Redis {
    fn restore(
        &self,
        _nextcloud: &Nextcloud,
        source: &Path,
        _timeout: Option<Duration>,
    ) -> Result<(), Self::Error> {
        let dump = source.join(REDIS_DIR).join(DUMP_FILE);
        log::info!(target: "backend::redis", "Restore Redis dump to {}", self.dump.display());
        fs::copy(dump, &self.dump)?;
        Ok(())
    }
}
