//! `list`: shows the backups in the backup root.

use std::fmt::Write;

use crate::backup::chain::Chains;
use crate::backup::BackupInstance;
use crate::settings::Settings;

use super::{repository, ActionError};

/// One line per backup, oldest first, with its base and chain state.
pub fn render(instances: &[BackupInstance]) -> String {
    let chains = Chains::build(instances);
    let mut out = String::new();
    for instance in instances {
        let state = match chains.chain_of(instance) {
            Some(_) => "",
            None => "  (base missing)",
        };
        let name = instance.name().to_string();
        let kind = instance.kind().to_string();
        let _ = match instance.base() {
            Some(base) => writeln!(out, "{name:<40} {kind:<11} base {base}{state}"),
            None => writeln!(out, "{name:<40} {kind}{state}"),
        };
    }
    out
}

pub fn run(settings: &Settings) -> Result<Vec<BackupInstance>, ActionError> {
    let instances = repository(settings).instances()?;
    if instances.is_empty() {
        log::info!(target: "list", "No backups in {}", settings.backup.root.display());
    }
    print!("{}", render(&instances));
    Ok(instances)
}
