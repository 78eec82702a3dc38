//! `cleanup`: applies the retention policy to the backup root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};

use crate::archive::{self, archive_path};
use crate::backup::{prune, Repository, RetentionSettings};
use crate::settings::Settings;

use super::{lock, repository, ActionError};

/// What a cleanup removed, or would remove on a dry run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub partials: Vec<PathBuf>,
}

pub fn run(settings: &Settings, dry_run: bool) -> Result<CleanupReport, ActionError> {
    let repository = repository(settings);
    let _lock = match dry_run {
        true => None,
        false => Some(lock(&repository)?),
    };

    apply(
        &repository,
        &settings.retention,
        Some(&settings.archive_dir()),
        Local::now().naive_local(),
        dry_run,
    )
}

/// Removes expired and orphaned backups and stale partial backups.
///
/// The caller holds the lock of the repository. Archives of removed backups
/// in `archive_dir` are removed as well.
pub fn apply(
    repository: &Repository,
    retention: &RetentionSettings,
    archive_dir: Option<&Path>,
    now: NaiveDateTime,
    dry_run: bool,
) -> Result<CleanupReport, ActionError> {
    let instances = repository.instances()?;
    let plan = prune::plan(&instances, now, retention);
    let mut report = CleanupReport::default();

    log::info!(
        target: "cleanup",
        "Keeping {} backups, removing {}",
        plan.keep.len(),
        plan.remove.len()
    );
    for (instance, reason) in &plan.remove {
        if dry_run {
            log::info!(target: "cleanup", "Would remove {} ({reason})", instance.name());
        } else {
            log::info!(target: "cleanup", "Remove {} ({reason})", instance.name());
            repository.remove(instance)?;
            if let Some(archive_dir) = archive_dir {
                remove_archive(&archive_path(archive_dir, &instance.name().to_string()))?;
            }
        }
        report.removed.push(instance.name().to_string());
    }

    for partial in repository.stale_partials()? {
        if dry_run {
            log::info!(target: "cleanup", "Would remove incomplete backup {}", partial.display());
        } else {
            repository.remove_partial(&partial)?;
        }
        report.partials.push(partial);
    }

    if !dry_run {
        repository.refresh_latest()?;
    }

    Ok(report)
}

fn remove_archive(archive: &Path) -> Result<(), ActionError> {
    for file in [archive.to_path_buf(), archive::checksum_path(archive)] {
        match fs::remove_file(&file) {
            Ok(()) => log::debug!(target: "cleanup", "Removed {}", file.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ActionError::Io(file, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::backup::chain::tests::{day, make};
    use crate::backup::BackupKind;

    #[test]
    fn forty_daily_fulls_keep_thirty() {
        let dir = tempfile::tempdir().unwrap();
        let mut names = Vec::new();
        for n in 0..40 {
            names.push(make(dir.path(), day(n), BackupKind::Full, None).name().to_string());
        }
        let archives = dir.path().join("archives");
        fs::create_dir(&archives).unwrap();
        fs::write(archive_path(&archives, &names[0]), "").unwrap();
        fs::create_dir(dir.path().join(format!("{}.partial", names[39].replace("20240209", "20240210")))).unwrap();

        let repository = Repository::new(dir.path(), "nextcloud");
        let now = day(39) + TimeDelta::days(30);
        let retention = RetentionSettings::default();

        let preview = apply(&repository, &retention, Some(&archives), now, true).unwrap();
        assert_eq!(preview.removed, names[..10]);
        assert_eq!(repository.instances().unwrap().len(), 40);

        let report = apply(&repository, &retention, Some(&archives), now, false).unwrap();
        assert_eq!(report, preview);
        assert_eq!(report.partials.len(), 1);

        let surviving: Vec<_> = repository
            .instances()
            .unwrap()
            .iter()
            .map(|instance| instance.name().to_string())
            .collect();
        assert_eq!(surviving, names[10..]);
        assert!(!archive_path(&archives, &names[0]).exists());
        assert!(repository.stale_partials().unwrap().is_empty());
        assert_eq!(
            fs::read_link(dir.path().join("latest")).unwrap(),
            PathBuf::from(&names[39])
        );
    }
}
