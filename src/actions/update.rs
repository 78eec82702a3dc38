//! `check-update`: asks Nextcloud for available updates.

use crate::nextcloud::Nextcloud;
use crate::settings::Settings;

use super::{require_programs, ActionError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    /// Lines of `occ update:check` announcing an update.
    Available(Vec<String>),
}

/// Interprets the output of `occ update:check`.
///
/// Server and app updates are announced with a line ending in
/// `is available.`.
pub fn parse_update_check(output: &str) -> UpdateStatus {
    let updates: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| line.contains(" is available"))
        .map(str::to_string)
        .collect();

    if updates.is_empty() {
        UpdateStatus::UpToDate
    } else {
        UpdateStatus::Available(updates)
    }
}

pub fn run(settings: &Settings) -> Result<UpdateStatus, ActionError> {
    let nextcloud = Nextcloud::new(&settings.nextcloud, settings.steps.timeout())?;
    require_programs(nextcloud.occ().required_programs())?;

    let status = parse_update_check(&nextcloud.occ().update_check()?);
    match &status {
        UpdateStatus::UpToDate => log::info!(target: "update", "Nextcloud and its apps are up to date"),
        UpdateStatus::Available(updates) => {
            for update in updates {
                log::info!(target: "update", "{update}");
            }
        }
    }

    Ok(status)
}
