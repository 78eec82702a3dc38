//! `upload`: copies a backup archive to the remote storage.

use std::path::{Path, PathBuf};

use crate::archive;
use crate::backup::{BackupInstance, RepositoryError};
use crate::remote::{RemoteSettings, S3Remote};
use crate::settings::Settings;

use super::{require_programs, verify, ActionError};

/// Archive to upload for `target`, created from the backup directory if it
/// doesn't exist yet.
fn archive_of(settings: &Settings, target: Option<&str>, dry_run: bool) -> Result<PathBuf, ActionError> {
    let path = verify::resolve(settings, target)?;
    if path.is_file() {
        return Ok(path);
    }

    let instance = BackupInstance::open(&path)
        .map_err(|e| ActionError::Repository(RepositoryError::Instance(e)))?;
    let archive_dir = settings.archive_dir();
    let archive = archive::archive_path(&archive_dir, &instance.name().to_string());
    if !archive.exists() && !dry_run {
        archive::create(&instance, &archive_dir).map_err(ActionError::io(&archive))?;
    }
    Ok(archive)
}

/// Uploads `archive` and prunes the bucket to `remote.keep` archives.
pub fn upload_archive(
    remote_settings: &RemoteSettings,
    archive: &Path,
    settings: &Settings,
    dry_run: bool,
) -> Result<(), ActionError> {
    let remote = S3Remote::new(remote_settings.clone(), settings.steps.timeout());
    require_programs([remote.program()])?;

    remote.upload(archive, dry_run)?;
    if let Some(keep) = remote_settings.keep {
        let removed = remote.prune(keep, dry_run)?;
        if !removed.is_empty() {
            log::info!(target: "remote", "Pruned {} old archives", removed.len());
        }
    }
    Ok(())
}

pub fn run(settings: &Settings, target: Option<&str>, dry_run: bool) -> Result<(), ActionError> {
    let remote_settings = settings.remote.as_ref().ok_or(ActionError::NoRemote)?;
    let archive = archive_of(settings, target, dry_run)?;
    upload_archive(remote_settings, &archive, settings, dry_run)
}
