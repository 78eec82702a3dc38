//! `restore`: writes a backup back into the installation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::archive;
use crate::backends::{Config, CopyMethod, Database, Files, Redis, Restore};
use crate::backup::instance::{APPS_DIR, REDIS_DIR};
use crate::nextcloud::{MaintenanceGuard, Nextcloud};
use crate::settings::Settings;
use crate::util::step::{BoxError, Journal, StepError, StepPolicy};

use super::{lock, repository, require_programs, verify, ActionError};

/// What to restore and from where.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Backup directory, archive or backup name. The latest backup if unset.
    pub backup: Option<String>,
    /// Date (`YYYYMMDD` or `YYYYMMDD_HHMMSS`) of the backup to restore.
    pub date: Option<String>,
    pub database: bool,
    pub data: bool,
    pub config: bool,
    pub apps: bool,
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            backup: None,
            date: None,
            database: true,
            data: true,
            config: true,
            apps: true,
            dry_run: false,
        }
    }
}

/// Extracted archive, removed again on drop.
struct Scratch {
    path: PathBuf,
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            log::warn!(target: "restore", "Unable to remove {}: {e}", self.path.display());
        }
    }
}

/// The backup `options` select.
///
/// Only reads, so a backup that doesn't exist is reported before anything
/// is changed.
fn resolve(settings: &Settings, options: &RestoreOptions) -> Result<PathBuf, ActionError> {
    let query = options.backup.as_deref().or(options.date.as_deref());
    let path = verify::resolve(settings, query)?;
    log::info!(target: "restore", "Restoring from {}", path.display());
    Ok(path)
}

struct Steps<'a> {
    journal: Journal,
    policy: StepPolicy,
    nextcloud: &'a Nextcloud,
    source: &'a Path,
}

impl Steps<'_> {
    fn restore<B>(&mut self, backend: &B) -> Result<(), StepError>
    where
        B: Restore,
        B::Error: Into<BoxError>,
    {
        let (nextcloud, source) = (self.nextcloud, self.source);
        self.journal.run(backend.name(), &self.policy, |timeout| {
            backend.restore(nextcloud, source, timeout)
        })?;
        Ok(())
    }
}

pub fn run(settings: &Settings, options: &RestoreOptions) -> Result<(), ActionError> {
    let path = resolve(settings, options)?;
    let table_prefix = &settings.database.table_prefix;
    let report = verify::verify_path(&path, table_prefix);
    report.log(&path);
    if !report.is_valid() {
        return Err(ActionError::Invalid(path));
    }

    let nextcloud = Nextcloud::new(&settings.nextcloud, settings.steps.timeout())?;
    let mut programs = nextcloud.occ().required_programs();
    if options.database {
        programs.push(&settings.database.client_command);
    }
    if settings.backup.copy_method == CopyMethod::Rsync && (options.data || options.apps) {
        programs.push("rsync");
    }
    require_programs(programs)?;

    if options.dry_run {
        log::info!(
            target: "restore",
            "Would restore {}{}{}{}from {}",
            if options.config { "config " } else { "" },
            if options.data { "data " } else { "" },
            if options.apps { "apps " } else { "" },
            if options.database { "database " } else { "" },
            path.display()
        );
        return Ok(());
    }

    let repository = repository(settings);
    let _lock = lock(&repository)?;

    let _scratch;
    let source = if path.is_file() {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = repository.root().join(format!(".restore-{name}"));
        // left over by an interrupted restore, would mix into the extracted tree
        match fs::remove_dir_all(&target) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(ActionError::Io(target, e));
            }
            _ => {}
        }
        let scratch = Scratch {
            path: target.clone(),
        };
        archive::extract(&path, &target).map_err(ActionError::io(&path))?;
        _scratch = scratch;
        target
    } else {
        path
    };

    let occ = nextcloud.occ();
    let _maintenance = MaintenanceGuard::enable(occ)?;
    let method = settings.backup.copy_method;
    let mut steps = Steps {
        journal: Journal::in_memory(),
        // restores change the live installation, no blind retries
        policy: settings.steps.once(),
        nextcloud: &nextcloud,
        source: &source,
    };

    if options.config {
        steps.restore(&Config::new(settings.backup.mask_dbpassword))?;
    }
    if options.data {
        steps.restore(&Files::data(method))?;
    }
    if options.apps {
        if source.join(APPS_DIR).is_dir() {
            steps.restore(&Files::apps(method))?;
        } else {
            steps.journal.skip("apps", "backup contains no apps");
        }
    }
    match &settings.backup.redis_dump {
        Some(dump) if source.join(REDIS_DIR).is_dir() => steps.restore(&Redis::new(dump.clone()))?,
        _ => {}
    }
    if options.database {
        steps.restore(&Database::with_config(settings.database.clone()))?;
    }

    steps
        .journal
        .run("fingerprint", &steps.policy, |_| occ.data_fingerprint())?;
    log::info!(target: "restore", "Restore finished");

    Ok(())
}
