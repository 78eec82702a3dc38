//! `backup`: takes a full or incremental backup of the installation.
//!
//! The backup is written to a partial directory while Nextcloud is in
//! maintenance mode. Once every backend succeeded the backup is committed and
//! the follow-up steps (archive, upload, cleanup, app updates) run. Their
//! failures are reported but leave the committed backup in place.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};

use crate::archive;
use crate::backends::{Backup, Config, CopyMethod, Database, Destination, Files, Redis};
use crate::backup::{plan, BackupInstance, BackupName, Repository};
use crate::nextcloud::{MaintenanceGuard, Nextcloud};
use crate::settings::Settings;
use crate::util::step::{BoxError, Journal, StepError, StepPolicy, JOURNAL_FILE};

use super::{cleanup, lock, notify, repository, require_programs, upload, ActionError};

/// What a backup run does beyond the backup itself.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Take a full backup even if an incremental one is possible.
    pub force_full: bool,
    /// Update Nextcloud apps after the backup.
    pub update_apps: bool,
    pub archive: bool,
    pub upload: bool,
    pub cleanup: bool,
    pub dry_run: bool,
}

impl BackupOptions {
    /// Follow-up steps as configured in `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            archive: settings.backup.archive,
            upload: settings.backup.upload,
            cleanup: settings.backup.cleanup,
            ..Default::default()
        }
    }
}

/// Runs the backends of one backup run through the journal.
struct Steps<'a> {
    journal: Journal,
    policy: StepPolicy,
    nextcloud: &'a Nextcloud,
    root: &'a Path,
    base: Option<&'a Path>,
    dry_run: bool,
}

impl Steps<'_> {
    fn backup<B>(&mut self, backend: &B) -> Result<(), StepError>
    where
        B: Backup,
        B::Error: Into<BoxError>,
    {
        let (nextcloud, root, base, dry_run) = (self.nextcloud, self.root, self.base, self.dry_run);
        self.journal.run(backend.name(), &self.policy, |timeout| {
            backend.backup(nextcloud, &Destination { root, base, timeout }, dry_run)
        })?;
        Ok(())
    }

    fn run_backends(&mut self, settings: &Settings) -> Result<(), StepError> {
        let method = settings.backup.copy_method;

        self.backup(&Database::with_config(settings.database.clone()))?;
        self.backup(&Config::new(settings.backup.mask_dbpassword))?;
        self.backup(&Files::data(method))?;
        if settings.backup.include_apps {
            if self.nextcloud.apps_dir().is_dir() {
                self.backup(&Files::apps(method))?;
            } else {
                self.journal.skip("apps", "no custom apps directory");
            }
        }
        if let Some(dump) = &settings.backup.redis_dump {
            self.backup(&Redis::new(dump.clone()))?;
        }

        Ok(())
    }
}

/// Runs a backup and sends a notification about its outcome.
///
/// Returns the new backup, [None] on a dry run.
pub fn run(settings: &Settings, options: &BackupOptions) -> Result<Option<BackupInstance>, ActionError> {
    let timeout = settings.steps.timeout();
    let nextcloud = match Nextcloud::new(&settings.nextcloud, timeout) {
        Ok(nextcloud) => nextcloud,
        Err(e) => {
            let e = ActionError::from(e);
            if !options.dry_run {
                notify::send(&settings.notify, None, false, &e.to_string(), timeout);
            }
            return Err(e);
        }
    };

    let result = perform(settings, options, &nextcloud);
    if !options.dry_run {
        let message = match &result {
            Ok(Some(instance)) => format!("Backup {} completed", instance.name()),
            Ok(None) => String::new(),
            Err(e) => e.to_string(),
        };
        notify::send(
            &settings.notify,
            Some(nextcloud.occ()),
            result.is_ok(),
            &message,
            timeout,
        );
    }

    result
}

fn required_programs<'a>(settings: &'a Settings, options: &BackupOptions, nextcloud: &'a Nextcloud) -> Vec<&'a str> {
    let mut programs = nextcloud.occ().required_programs();
    programs.push(&settings.database.dump_command);
    if settings.backup.copy_method == CopyMethod::Rsync {
        programs.push("rsync");
    }
    if let Some(remote) = settings.remote.as_ref().filter(|_| options.upload) {
        programs.push(&remote.aws_command);
    }
    programs
}

fn perform(
    settings: &Settings,
    options: &BackupOptions,
    nextcloud: &Nextcloud,
) -> Result<Option<BackupInstance>, ActionError> {
    if options.upload && settings.remote.is_none() {
        return Err(ActionError::NoRemote);
    }
    require_programs(required_programs(settings, options, nextcloud))?;

    let occ = nextcloud.occ();
    let repository = repository(settings);
    let _lock = match options.dry_run {
        true => None,
        false => Some(lock(&repository)?),
    };

    let instances = repository.instances()?;
    let plan = plan::decide(&instances, options.force_full, settings.backup.max_incrementals);
    match &plan.base {
        Some(base) => log::info!(target: "backup", "Incremental backup based on {}", base.name()),
        None => log::info!(target: "backup", "Full backup: {}", plan.reason),
    }
    let now = Local::now().naive_local();
    let base = plan.base.as_ref().map(BackupInstance::path);

    if options.dry_run {
        let name = BackupName::new(&settings.backup.prefix, now, plan.kind);
        let root = repository.root().join(name.to_string());
        log::info!(target: "backup", "Would write backup {}", root.display());
        occ.maintenance()?;

        let mut steps = Steps {
            journal: Journal::in_memory(),
            policy: settings.steps.once(),
            nextcloud,
            root: &root,
            base,
            dry_run: true,
        };
        steps.run_backends(settings)?;
        if options.update_apps {
            occ.update_apps(true)?;
        }
        log::info!(target: "backup", "Dry run finished, nothing was changed");
        return Ok(None);
    }

    let mut partial = repository.begin(plan.kind, plan.base.as_ref(), now)?;
    match occ.version() {
        Ok(version) => partial.metadata_mut().nextcloud_version = version,
        Err(e) => log::warn!(target: "backup", "Unable to determine the Nextcloud version: {e}"),
    }
    let journal_path = partial.path().join(JOURNAL_FILE);
    let journal = Journal::open(&journal_path).map_err(ActionError::io(&journal_path))?;

    {
        let _maintenance = MaintenanceGuard::enable(occ)?;
        let mut steps = Steps {
            journal,
            policy: settings.steps,
            nextcloud,
            root: partial.path(),
            base,
            dry_run: false,
        };
        if let Err(e) = steps.run_backends(settings) {
            log::error!(
                target: "backup",
                "Backup left incomplete at {}, it is removed by the next cleanup",
                partial.path().display()
            );
            return Err(e.into());
        }
    }

    let instance = repository.commit(partial)?;
    let failed = follow_up(settings, options, nextcloud, &repository, &instance, now);
    if failed.is_empty() {
        Ok(Some(instance))
    } else {
        Err(ActionError::FollowUp(failed))
    }
}

/// Archives `instance` and checks the result.
fn create_verified(instance: &BackupInstance, archive_dir: &Path, table_prefix: &str) -> Result<PathBuf, ActionError> {
    let archive = archive::create(instance, archive_dir).map_err(ActionError::io(archive_dir))?;
    let report = archive::verify_archive(&archive, table_prefix);
    report.log(&archive);
    if report.is_valid() {
        Ok(archive)
    } else {
        Err(ActionError::Invalid(archive))
    }
}

/// Steps after the commit. Returns the keys of the failed steps.
fn follow_up(
    settings: &Settings,
    options: &BackupOptions,
    nextcloud: &Nextcloud,
    repository: &Repository,
    instance: &BackupInstance,
    now: NaiveDateTime,
) -> Vec<String> {
    let journal_path = instance.path().join(JOURNAL_FILE);
    let mut journal = Journal::open(&journal_path).unwrap_or_else(|e| {
        log::warn!(target: "backup", "Unable to reopen step journal {}: {e}", journal_path.display());
        Journal::in_memory()
    });
    let policy = settings.steps;
    let archive_dir = settings.archive_dir();

    let mut archive = None;
    if options.archive {
        let created = journal.run("archive", &policy.once(), |_| {
            create_verified(instance, &archive_dir, &settings.database.table_prefix)
        });
        archive = created.ok().flatten();
    }

    if options.upload {
        match (&settings.remote, &archive) {
            (Some(remote), Some(archive)) => {
                let _ = journal.run("upload", &policy, |_| {
                    upload::upload_archive(remote, archive, settings, false)
                });
            }
            _ => journal.skip("upload", "no archive to upload"),
        }
    }

    if options.cleanup {
        let _ = journal.run("cleanup", &policy.once(), |_| {
            cleanup::apply(
                repository,
                &settings.retention,
                Some(&archive_dir),
                now,
                false,
            )
        });
    }

    if options.update_apps {
        let _ = journal.run("update-apps", &policy.once(), |_| nextcloud.occ().update_apps(false));
    }

    let mut failed: Vec<String> = journal.failed().into_iter().map(str::to_string).collect();
    if options.upload && archive.is_none() {
        failed.push("upload".into());
    }
    failed
}
