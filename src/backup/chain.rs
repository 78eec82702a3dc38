//! Grouping of backups into chains.
//!
//! A chain is a full backup together with every incremental backup that
//! references it through its `base`, directly or through other incrementals.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use super::instance::{BackupInstance, BackupKind};

/// A full backup and its incrementals, oldest first.
#[derive(Debug)]
pub struct Chain<'a> {
    members: Vec<&'a BackupInstance>,
}

impl<'a> Chain<'a> {
    /// The full backup the chain starts with.
    pub fn root(&self) -> &'a BackupInstance {
        self.members[0]
    }

    pub fn members(&self) -> &[&'a BackupInstance] {
        &self.members
    }

    pub fn newest(&self) -> &'a BackupInstance {
        self.members[self.members.len() - 1]
    }

    pub fn created(&self) -> NaiveDateTime {
        self.newest().created()
    }

    pub fn contains(&self, instance: &BackupInstance) -> bool {
        self.members.iter().any(|member| member.path() == instance.path())
    }

    /// Number of incremental backups in the chain.
    pub fn incrementals(&self) -> usize {
        self.members.len() - 1
    }
}

/// All backups grouped into chains.
#[derive(Debug)]
pub struct Chains<'a> {
    /// Oldest chain (by newest member) first.
    pub chains: Vec<Chain<'a>>,
    /// Incremental backups whose base is missing.
    pub orphans: Vec<&'a BackupInstance>,
}

impl<'a> Chains<'a> {
    pub fn build(instances: &'a [BackupInstance]) -> Self {
        let by_name: HashMap<String, usize> = instances
            .iter()
            .enumerate()
            .map(|(idx, instance)| (instance.name().to_string(), idx))
            .collect();

        let mut members: HashMap<usize, Vec<&'a BackupInstance>> = HashMap::new();
        let mut orphans = Vec::new();
        for (idx, instance) in instances.iter().enumerate() {
            match root_of(instances, &by_name, idx) {
                Some(root) => members.entry(root).or_default().push(instance),
                None => orphans.push(instance),
            }
        }

        let mut chains: Vec<_> = members
            .into_values()
            .map(|mut members| {
                // the root is strictly older than its descendants
                members.sort_by_key(|member| (member.kind() != BackupKind::Full, member.name().clone()));
                Chain { members }
            })
            .collect();
        chains.sort_by_key(|chain| chain.newest().name().clone());
        orphans.sort_by_key(|orphan| orphan.name().clone());

        Self { chains, orphans }
    }

    /// Chain the backup belongs to, [None] for orphans.
    pub fn chain_of(&self, instance: &BackupInstance) -> Option<&Chain<'a>> {
        self.chains.iter().find(|chain| chain.contains(instance))
    }
}

/// Follows `base` references from `idx` to the full backup.
fn root_of(
    instances: &[BackupInstance],
    by_name: &HashMap<String, usize>,
    mut idx: usize,
) -> Option<usize> {
    // every hop must go to an older backup, a cycle can't be longer than this
    for _ in 0..=instances.len() {
        let instance = &instances[idx];
        if instance.kind() == BackupKind::Full {
            return Some(idx);
        }
        let base = *by_name.get(instance.base()?)?;
        if instances[base].created() >= instance.created() {
            return None;
        }
        idx = base;
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::path::Path;

    use chrono::{NaiveDate, TimeDelta};

    use super::*;
    use crate::backup::instance::{BackupMetadata, BackupName};

    pub(crate) fn day(n: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(2, 0, 0)
            .unwrap()
            + TimeDelta::days(n)
    }

    /// Creates a backup directory with metadata in `root`.
    pub(crate) fn make(
        root: &Path,
        created: NaiveDateTime,
        kind: BackupKind,
        base: Option<&BackupInstance>,
    ) -> BackupInstance {
        let name = BackupName::new("nextcloud", created, kind);
        let path = root.join(name.to_string());
        fs::create_dir_all(&path).unwrap();
        BackupMetadata {
            kind,
            base: base.map(|base| base.name().to_string()),
            created,
            nextcloud_version: None,
        }
        .write(&path)
        .unwrap();

        BackupInstance::open(&path).unwrap()
    }

    #[test]
    fn groups_incrementals_with_their_full() {
        let dir = tempfile::tempdir().unwrap();
        let full1 = make(dir.path(), day(0), BackupKind::Full, None);
        let incr1 = make(dir.path(), day(1), BackupKind::Incremental, Some(&full1));
        let incr2 = make(dir.path(), day(2), BackupKind::Incremental, Some(&incr1));
        let full2 = make(dir.path(), day(3), BackupKind::Full, None);
        let incr3 = make(dir.path(), day(4), BackupKind::Incremental, Some(&full2));
        let instances = vec![full1, incr1, incr2, full2, incr3];

        let chains = Chains::build(&instances);
        assert!(chains.orphans.is_empty());
        assert_eq!(chains.chains.len(), 2);
        assert_eq!(chains.chains[0].root(), &instances[0]);
        assert_eq!(chains.chains[0].incrementals(), 2);
        assert_eq!(chains.chains[1].root(), &instances[3]);
        assert_eq!(chains.chains[1].newest(), &instances[4]);
        assert_eq!(
            chains.chain_of(&instances[2]).map(Chain::root),
            Some(&instances[0])
        );
    }

    #[test]
    fn missing_base_makes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let full = make(dir.path(), day(0), BackupKind::Full, None);
        let incr1 = make(dir.path(), day(1), BackupKind::Incremental, Some(&full));
        let incr2 = make(dir.path(), day(2), BackupKind::Incremental, Some(&incr1));
        // the full backup is gone, both incrementals are orphaned
        let instances = vec![incr1, incr2];

        let chains = Chains::build(&instances);
        assert!(chains.chains.is_empty());
        assert_eq!(chains.orphans.len(), 2);
    }

    #[test]
    fn incremental_without_recorded_base_is_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nextcloud_20240101_020000_incr");
        fs::create_dir_all(&path).unwrap();
        let instances = vec![BackupInstance::open(&path).unwrap()];

        let chains = Chains::build(&instances);
        assert_eq!(chains.orphans.len(), 1);
    }
}
