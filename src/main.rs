use std::error::Error;
use std::process::ExitCode;

use chrono::Local;
use clap::Parser;

use nc_guard_lib::actions::backup::{self, BackupOptions};
use nc_guard_lib::actions::restore::{self, RestoreOptions};
use nc_guard_lib::actions::update::{self, UpdateStatus};
use nc_guard_lib::actions::{cleanup, list, upload, verify, ActionError};
use nc_guard_lib::cli::{flag, Action, Cli};
use nc_guard_lib::settings::Settings;
use nc_guard_lib::util::logging;

/// Exit code of `check-update` if an update is available.
const UPDATE_AVAILABLE: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // settings are needed for the log directory, errors are logged once the
    // logger is up
    let settings = Settings::load_or_init(&cli.config).map(|mut settings| {
        if let Some(backup_dir) = &cli.backup_dir {
            settings.backup.root = backup_dir.clone();
        }
        settings
    });

    let log_dir = settings
        .as_ref()
        .ok()
        .filter(|_| !cli.dry_run)
        .map(|settings| (settings.log_directory(), settings.log.prefix.clone()));
    logging::init(
        cli.verbose,
        log_dir.as_ref().map(|(dir, prefix)| (dir.as_path(), prefix.as_str())),
    );

    let settings = match settings.and_then(|settings| settings.validate().map(|()| settings)) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        log::warn!("Running in dry-run mode");
    } else if let Some((dir, prefix)) = &log_dir {
        if let Err(e) = logging::prune_logs(dir, prefix, settings.log.keep_days, Local::now().date_naive()) {
            log::warn!("Removing old log files failed: {e}");
        }
    }

    match run(cli, &settings) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            let mut source = e.source();
            while let Some(cause) = source {
                log::debug!("Caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, settings: &Settings) -> Result<ExitCode, ActionError> {
    let dry_run = cli.dry_run;
    match cli.action {
        Action::Backup(args) => {
            let configured = BackupOptions::from_settings(settings);
            let options = BackupOptions {
                force_full: args.full,
                update_apps: args.update,
                archive: flag(args.archive, args.no_archive, configured.archive),
                upload: flag(args.upload, args.no_upload, configured.upload),
                cleanup: args.cleanup && configured.cleanup,
                dry_run,
            };
            backup::run(settings, &options)?;
        }
        Action::Restore(args) if args.list => {
            list::run(settings)?;
        }
        Action::Restore(args) => {
            let options = RestoreOptions {
                backup: args.backup,
                date: args.date,
                database: args.database,
                data: args.data,
                config: args.restore_config,
                apps: args.apps,
                dry_run,
            };
            restore::run(settings, &options)?;
        }
        Action::Verify { backup } => {
            verify::run(settings, backup.as_deref())?;
        }
        Action::Cleanup => {
            let report = cleanup::run(settings, dry_run)?;
            log::info!(
                "Cleanup finished: {} backups and {} incomplete backups removed",
                report.removed.len(),
                report.partials.len()
            );
        }
        Action::List => {
            list::run(settings)?;
        }
        Action::Upload { backup } => {
            upload::run(settings, backup.as_deref(), dry_run)?;
        }
        Action::CheckUpdate => {
            if let UpdateStatus::Available(_) = update::run(settings)? {
                return Ok(ExitCode::from(UPDATE_AVAILABLE));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
