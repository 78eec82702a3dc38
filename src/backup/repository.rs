//! The backup root directory holding all backups.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use derive_more::{Display, Error};

use super::instance::{
    BackupInstance, BackupKind, BackupMetadata, BackupName, InstanceError, MetadataError,
};

/// Suffix of backups still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Symlink to the newest backup.
pub const LATEST_LINK: &str = "latest";

const LOCK_FILE: &str = ".nc_guard.lock";

#[derive(Debug, Display, Error)]
pub enum RepositoryError {
    #[display("Unable to access backup root {}: {_1}", _0.display())]
    Io(PathBuf, #[error(source)] io::Error),
    #[display("Writing metadata of {} failed: {_1}", _0.display())]
    Metadata(PathBuf, #[error(source)] MetadataError),
    #[display("Backup already exists: {}", _0.display())]
    Exists(#[error(ignore)] PathBuf),
    #[display("Backup not found: {_0}")]
    NotFound(#[error(ignore)] String),
    Instance(InstanceError),
}

/// Backups of one prefix in the backup root.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    prefix: String,
}

/// A backup being written, see [`Repository::begin`].
#[derive(Debug)]
pub struct PartialBackup {
    path: PathBuf,
    name: BackupName,
    metadata: BackupMetadata,
}

impl PartialBackup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &BackupName {
        &self.name
    }

    pub fn metadata_mut(&mut self) -> &mut BackupMetadata {
        &mut self.metadata
    }
}

impl Repository {
    /// Backups named `<prefix>_...` in `root`.
    ///
    /// Nothing is created until a backup is started.
    pub fn new(root: &Path, prefix: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn io_err(&self) -> impl Fn(io::Error) -> RepositoryError + '_ {
        |e| RepositoryError::Io(self.root.clone(), e)
    }

    /// Completed backups, oldest first.
    ///
    /// Directories with unparsable names or another prefix are ignored. Backups
    /// whose metadata can't be read are skipped with a warning.
    pub fn instances(&self) -> Result<Vec<BackupInstance>, RepositoryError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err()(e)),
        };

        let mut instances = Vec::new();
        for entry in entries {
            let entry = entry.map_err(self.io_err())?;
            let file_type = entry.file_type().map_err(self.io_err())?;
            if !file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            if entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                continue;
            }

            match BackupInstance::open(&path) {
                Ok(instance) if instance.name().prefix() == self.prefix => instances.push(instance),
                Ok(_) => {}
                Err(InstanceError::Name(e)) => {
                    log::debug!(target: "backup::repository", "Ignoring {}: {e}", path.display())
                }
                Err(e) => log::warn!(target: "backup::repository", "Skipping backup {e}"),
            }
        }
        instances.sort_by(|a, b| a.name().cmp(b.name()));

        Ok(instances)
    }

    pub fn latest(&self) -> Result<Option<BackupInstance>, RepositoryError> {
        Ok(self.instances()?.pop())
    }

    /// Looks up a backup by path, exact name or date prefix.
    ///
    /// A date prefix (`YYYYMMDD` or `YYYYMMDD_HHMMSS`) selects the newest
    /// backup whose timestamp starts with it.
    pub fn find(&self, query: &str) -> Result<BackupInstance, RepositoryError> {
        let not_found = || RepositoryError::NotFound(query.to_string());

        let as_path = Path::new(query);
        if query.contains('/') {
            return match as_path.is_dir() {
                true => BackupInstance::open(as_path).map_err(|_| not_found()),
                false => Err(not_found()),
            };
        }

        let instances = self.instances()?;
        if let Some(instance) = instances
            .iter()
            .find(|instance| instance.name().to_string() == query)
        {
            return Ok(instance.clone());
        }

        instances
            .into_iter()
            .rev()
            .find(|instance| {
                instance
                    .created()
                    .format(super::instance::TIMESTAMP_FORMAT)
                    .to_string()
                    .starts_with(query)
            })
            .ok_or_else(not_found)
    }

    /// Leftovers of runs that never completed.
    pub fn stale_partials(&self) -> Result<Vec<PathBuf>, RepositoryError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err()(e)),
        };

        let mut partials = Vec::new();
        for entry in entries {
            let entry = entry.map_err(self.io_err())?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_ours = name
                .strip_suffix(PARTIAL_SUFFIX)
                .and_then(|name| name.parse::<BackupName>().ok())
                .is_some_and(|name| name.prefix() == self.prefix);
            if is_ours {
                partials.push(entry.path());
            }
        }
        partials.sort();

        Ok(partials)
    }

    /// Creates the directory of a new backup.
    pub fn begin(
        &self,
        kind: BackupKind,
        base: Option<&BackupInstance>,
        created: NaiveDateTime,
    ) -> Result<PartialBackup, RepositoryError> {
        let name = BackupName::new(&self.prefix, created, kind);
        if self.root.join(name.to_string()).exists() {
            return Err(RepositoryError::Exists(self.root.join(name.to_string())));
        }

        let path = self.root.join(format!("{name}{PARTIAL_SUFFIX}"));
        fs::create_dir_all(&self.root).map_err(self.io_err())?;
        fs::create_dir(&path).map_err(|e| RepositoryError::Io(path.clone(), e))?;
        log::debug!(target: "backup::repository", "Started backup {}", path.display());

        let metadata = BackupMetadata {
            kind,
            base: base.map(|base| base.name().to_string()),
            created,
            nextcloud_version: None,
        };

        Ok(PartialBackup {
            path,
            name,
            metadata,
        })
    }

    /// Completes a backup: metadata, final name and `latest` link.
    pub fn commit(&self, partial: PartialBackup) -> Result<BackupInstance, RepositoryError> {
        let PartialBackup {
            path,
            name,
            metadata,
        } = partial;

        metadata
            .write(&path)
            .map_err(|e| RepositoryError::Metadata(path.clone(), e))?;

        let final_path = self.root.join(name.to_string());
        fs::rename(&path, &final_path).map_err(|e| RepositoryError::Io(final_path.clone(), e))?;
        log::info!(target: "backup::repository", "Completed backup {}", final_path.display());

        self.refresh_latest()?;

        BackupInstance::open(&final_path).map_err(RepositoryError::Instance)
    }

    /// Deletes a completed backup.
    pub fn remove(&self, instance: &BackupInstance) -> Result<(), RepositoryError> {
        fs::remove_dir_all(instance.path())
            .map_err(|e| RepositoryError::Io(instance.path().to_path_buf(), e))?;
        log::info!(target: "backup::repository", "Removed backup {}", instance.name());
        Ok(())
    }

    /// Deletes a leftover partial backup.
    pub fn remove_partial(&self, path: &Path) -> Result<(), RepositoryError> {
        fs::remove_dir_all(path).map_err(|e| RepositoryError::Io(path.to_path_buf(), e))?;
        log::info!(target: "backup::repository", "Removed incomplete backup {}", path.display());
        Ok(())
    }

    /// Points the `latest` link at the newest backup, or removes it.
    pub fn refresh_latest(&self) -> Result<(), RepositoryError> {
        let link = self.root.join(LATEST_LINK);
        let Some(latest) = self.latest()? else {
            match fs::remove_file(&link) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    return Err(RepositoryError::Io(link, e))
                }
                _ => return Ok(()),
            }
        };

        // swap the link atomically
        let tmp = self.root.join(format!(".{LATEST_LINK}.tmp"));
        let _ = fs::remove_file(&tmp);
        symlink(latest.name().to_string(), &tmp).map_err(|e| RepositoryError::Io(tmp.clone(), e))?;
        fs::rename(&tmp, &link).map_err(|e| RepositoryError::Io(link.clone(), e))?;

        Ok(())
    }
}
