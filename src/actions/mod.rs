//! The subcommands of `nc_guard`.
//!
//! Every action receives the [Settings] loaded at startup. Mutating actions
//! hold the [RunLock](crate::util::lock::RunLock) of the backup root while
//! they run.
//!
//! [Settings]: crate::settings::Settings

pub mod backup;
pub mod cleanup;
pub mod list;
pub mod notify;
pub mod restore;
pub mod update;
pub mod upload;
pub mod verify;

use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::backup::{Repository, RepositoryError};
use crate::nextcloud::OccError;
use crate::remote::RemoteError;
use crate::settings::Settings;
use crate::util::command;
use crate::util::lock::{LockError, RunLock};
use crate::util::step::StepError;

#[derive(Debug, Display, Error, From)]
pub enum ActionError {
    #[from]
    Repository(RepositoryError),
    #[from]
    Lock(LockError),
    #[display("Nextcloud: {_0}")]
    #[from]
    Occ(OccError),
    #[from]
    Step(StepError),
    #[display("Remote storage: {_0}")]
    #[from]
    Remote(RemoteError),
    /// Environment error, detected before anything is changed.
    #[display("Required programs not found: {}", _0.join(", "))]
    MissingPrograms(#[error(ignore)] Vec<String>),
    #[display("{}: {_1}", _0.display())]
    Io(PathBuf, #[error(source)] io::Error),
    #[display("Backup not found: {}", _0.display())]
    NotFound(#[error(ignore)] PathBuf),
    #[display("Backup {} failed verification", _0.display())]
    Invalid(#[error(ignore)] PathBuf),
    /// The backup itself completed, later steps did not.
    #[display("Backup completed, but these steps failed: {}", _0.join(", "))]
    FollowUp(#[error(ignore)] Vec<String>),
    #[display("No [remote] storage configured")]
    NoRemote,
}

impl ActionError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> ActionError + '_ {
        move |e| ActionError::Io(path.to_path_buf(), e)
    }
}

/// Fails if any of `programs` can't be executed.
pub fn require_programs<'a>(programs: impl IntoIterator<Item = &'a str>) -> Result<(), ActionError> {
    let mut missing: Vec<String> = programs
        .into_iter()
        .filter(|program| !command::is_available(program))
        .map(str::to_string)
        .collect();
    missing.dedup();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ActionError::MissingPrograms(missing))
    }
}

/// The backup repository configured in `settings`.
pub fn repository(settings: &Settings) -> Repository {
    Repository::new(&settings.backup.root, &settings.backup.prefix)
}

/// Creates the backup root if needed and locks it.
fn lock(repository: &Repository) -> Result<RunLock, ActionError> {
    let root = repository.root();
    std::fs::create_dir_all(root).map_err(ActionError::io(root))?;
    Ok(RunLock::acquire(&repository.lock_path())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_programs_are_listed() {
        assert!(require_programs(["sh"]).is_ok());

        let err = require_programs(["sh", "nc-guard-missing", "nc-guard-missing"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Required programs not found: nc-guard-missing"
        );
    }
}
