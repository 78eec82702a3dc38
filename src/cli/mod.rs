use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use log::LevelFilter;

use crate::settings::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file, created with defaults if missing.
    #[arg(long, global = true, env = "NC_GUARD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Folder of the backups and backup-logs, overrides `backup.root`.
    #[arg(long = "backup-dir", short = 'b', visible_short_alias = 'r', global = true)]
    pub backup_dir: Option<PathBuf>,

    /// Simulative run, nothing is changed.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Backup the Nextcloud config, database and data.
    Backup(BackupArgs),
    /// Restore a backup into the Nextcloud installation.
    Restore(RestoreArgs),
    /// Check a backup directory or archive.
    Verify {
        /// Backup directory, archive, name or date. Defaults to the latest backup.
        backup: Option<String>,
    },
    /// Remove backups according to the retention policy.
    Cleanup,
    /// List the backups.
    List,
    /// Upload the archive of a backup to the remote storage.
    Upload {
        /// Archive, backup directory, name or date. Defaults to the latest backup.
        backup: Option<String>,
    },
    /// Check for Nextcloud updates. Exits with 2 if an update is available.
    CheckUpdate,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Take a full backup even if an incremental one is possible.
    #[arg(long)]
    pub full: bool,

    /// Update nextcloud apps after backup.
    #[arg(long)]
    pub update: bool,

    /// Create an archive of the backup, overrides `backup.archive`.
    #[arg(long, overrides_with = "no_archive")]
    pub archive: bool,

    #[arg(long, hide = true)]
    pub no_archive: bool,

    /// Upload the archive, overrides `backup.upload`.
    #[arg(long, overrides_with = "no_upload")]
    pub upload: bool,

    #[arg(long, hide = true)]
    pub no_upload: bool,

    /// Don't apply the retention policy afterwards.
    #[arg(long = "no-cleanup", action = ArgAction::SetFalse)]
    pub cleanup: bool,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Backup directory, archive or name. Defaults to the latest backup.
    #[arg(conflicts_with = "date")]
    pub backup: Option<String>,

    /// Restore the newest backup of this date (YYYYMMDD or YYYYMMDD_HHMMSS).
    #[arg(long, short = 'd')]
    pub date: Option<String>,

    /// List the available backups instead of restoring.
    #[arg(long, short = 'l')]
    pub list: bool,

    #[arg(long = "no-database", action = ArgAction::SetFalse)]
    pub database: bool,

    #[arg(long = "no-data", action = ArgAction::SetFalse)]
    pub data: bool,

    // id apart from the global `--config`
    #[arg(long = "no-config", action = ArgAction::SetFalse)]
    pub restore_config: bool,

    #[arg(long = "no-apps", action = ArgAction::SetFalse)]
    pub apps: bool,
}

/// Resolves `--flag`/`--no-flag` pairs against the configured value.
pub fn flag(enabled: bool, disabled: bool, configured: bool) -> bool {
    match (enabled, disabled) {
        (true, _) => true,
        (_, true) => false,
        _ => configured,
    }
}
