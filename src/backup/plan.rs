//! Decision between a full and an incremental backup.

use super::chain::Chains;
use super::instance::{BackupInstance, BackupKind};

/// What the next backup will be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    pub kind: BackupKind,
    /// Backup to hard-link against, set for incremental backups.
    pub base: Option<BackupInstance>,
    /// Why a full backup is taken.
    pub reason: &'static str,
}

impl BackupPlan {
    fn full(reason: &'static str) -> Self {
        Self {
            kind: BackupKind::Full,
            base: None,
            reason,
        }
    }
}

/// Plans the next backup given the existing `instances`.
///
/// An incremental backup is based on the newest backup, as long as that one
/// belongs to an intact chain with fewer than `max_incrementals`
/// incrementals.
pub fn decide(
    instances: &[BackupInstance],
    force_full: bool,
    max_incrementals: Option<usize>,
) -> BackupPlan {
    if force_full {
        return BackupPlan::full("full backup requested");
    }
    let Some(latest) = instances.iter().max_by_key(|instance| instance.name().clone()) else {
        return BackupPlan::full("no previous backup");
    };

    let chains = Chains::build(instances);
    let Some(chain) = chains.chain_of(latest) else {
        return BackupPlan::full("chain of the latest backup is broken");
    };
    if max_incrementals.is_some_and(|max| chain.incrementals() >= max) {
        return BackupPlan::full("maximum number of incremental backups reached");
    }

    BackupPlan {
        kind: BackupKind::Incremental,
        base: Some(latest.clone()),
        reason: "previous backup available",
    }
}
