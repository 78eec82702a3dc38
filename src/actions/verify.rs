//! `verify`: checks a backup directory or archive.

use std::path::{Path, PathBuf};

use crate::archive::{self, VerifyReport};
use crate::settings::Settings;

use super::{repository, ActionError};

/// Resolves `target` to a path: an existing file or directory, a backup name
/// or date, or the latest backup if `None`.
pub(super) fn resolve(settings: &Settings, target: Option<&str>) -> Result<PathBuf, ActionError> {
    let repository = repository(settings);
    match target {
        Some(target) if target.contains('/') || archive::is_archive(Path::new(target)) => {
            let path = PathBuf::from(target);
            if path.exists() {
                Ok(path)
            } else {
                Err(ActionError::NotFound(path))
            }
        }
        Some(query) => Ok(repository.find(query)?.path().to_path_buf()),
        None => repository
            .latest()?
            .map(|latest| latest.path().to_path_buf())
            .ok_or_else(|| ActionError::NotFound(settings.backup.root.join("latest"))),
    }
}

/// Verifies the backup at `path`, archive or directory.
pub fn verify_path(path: &Path, table_prefix: &str) -> VerifyReport {
    if path.is_file() {
        archive::verify_archive(path, table_prefix)
    } else {
        archive::verify_dir(path, table_prefix)
    }
}

pub fn run(settings: &Settings, target: Option<&str>) -> Result<VerifyReport, ActionError> {
    let path = resolve(settings, target)?;
    let report = verify_path(&path, &settings.database.table_prefix);
    report.log(&path);

    if report.is_valid() {
        Ok(report)
    } else {
        Err(ActionError::Invalid(path))
    }
}
