//! Chain based retention of backups.
//!
//! Chains are kept or removed as a whole, so a surviving incremental backup
//! always has its base. A chain survives if any of these holds:
//!
//! - one of its backups is younger than [`keep_all_days`](RetentionSettings::keep_all_days),
//! - it is one of the [`keep_chains`](RetentionSettings::keep_chains) newest chains,
//! - it holds the newest full backup,
//! - the optional [calendar](RetentionSettings::calendar) selects one of its backups.
//!
//! Incremental backups whose base chain is broken are removed in any case.

use std::fmt;

use chrono::{NaiveDateTime, TimeDelta};

use super::chain::Chains;
use super::instance::{BackupInstance, BackupKind};
use crate::util::retention::{CalendarRetention, CalendarSelector};

/// How long backups are kept.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Every backup younger than this many days is kept.
    pub keep_all_days: u32,

    /// Number of most recent chains to keep.
    pub keep_chains: usize,

    /// Additional calendar based retention.
    pub calendar: Option<CalendarRetention>,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            keep_all_days: 7,
            keep_chains: 30,
            calendar: None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PruneReason {
    /// The base chain of the incremental backup is broken.
    Orphaned,
    /// The chain isn't selected by any retention rule.
    Expired,
}

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orphaned => write!(f, "base backup missing"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Outcome of [plan].
#[derive(Debug, Default)]
pub struct PrunePlan<'a> {
    pub keep: Vec<&'a BackupInstance>,
    pub remove: Vec<(&'a BackupInstance, PruneReason)>,
}

/// Decides which backups survive at `now`.
pub fn plan<'a>(
    instances: &'a [BackupInstance],
    now: NaiveDateTime,
    settings: &RetentionSettings,
) -> PrunePlan<'a> {
    let Chains { chains, orphans } = Chains::build(instances);
    let mut plan = PrunePlan::default();
    plan.remove
        .extend(orphans.into_iter().map(|orphan| (orphan, PruneReason::Orphaned)));

    let young_after = now - TimeDelta::days(i64::from(settings.keep_all_days));
    let newest_full = chains
        .iter()
        .map(|chain| chain.root())
        .filter(|root| root.kind() == BackupKind::Full)
        .max_by_key(|root| root.name().clone());
    let mut calendar = settings.calendar.map(CalendarSelector::new);

    // newest chain first
    for (rank, chain) in chains.iter().rev().enumerate() {
        let young = chain
            .members()
            .iter()
            .any(|member| member.created() > young_after);
        let recent = rank < settings.keep_chains;
        let holds_newest_full = newest_full.is_some_and(|full| chain.contains(full));
        // every member is offered to the calendar so it claims its periods
        let by_calendar = calendar.as_mut().is_some_and(|calendar| {
            chain
                .members()
                .iter()
                .rev()
                .fold(false, |selected, member| calendar.retain(member.created()) || selected)
        });

        if young || recent || holds_newest_full || by_calendar {
            plan.keep.extend(chain.members());
        } else {
            plan.remove
                .extend(chain.members().iter().map(|member| (*member, PruneReason::Expired)));
        }
    }

    plan.keep.sort_by_key(|instance| instance.name().clone());
    plan.remove.sort_by_key(|(instance, _)| instance.name().clone());
    plan
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::backup::chain::tests::{day, make};

    fn names(instances: &[&BackupInstance]) -> Vec<String> {
        instances.iter().map(|i| i.name().to_string()).collect()
    }

    fn removed(plan: &PrunePlan<'_>) -> Vec<String> {
        plan.remove.iter().map(|(i, _)| i.name().to_string()).collect()
    }

    #[test]
    fn forty_daily_fulls_keep_thirty() {
        let dir = tempfile::tempdir().unwrap();
        let instances: Vec<_> = (0..40)
            .map(|n| make(dir.path(), day(n), BackupKind::Full, None))
            .collect();
        let settings = RetentionSettings {
            keep_all_days: 7,
            keep_chains: 30,
            calendar: None,
        };

        let plan = plan(&instances, day(60), &settings);
        let expected: Vec<_> = instances[10..]
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(names(&plan.keep), expected);
        assert_eq!(plan.remove.len(), 10);
        assert!(plan
            .remove
            .iter()
            .all(|(_, reason)| *reason == PruneReason::Expired));
        assert_eq!(plan.remove[0].0.name().to_string(), "nextcloud_20240101_020000_full");
    }

    #[test]
    fn young_backups_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let instances: Vec<_> = (0..10)
            .map(|n| make(dir.path(), day(n), BackupKind::Full, None))
            .collect();
        let settings = RetentionSettings {
            keep_all_days: 7,
            keep_chains: 1,
            calendar: None,
        };

        // day(3) is exactly seven days old and no longer young
        let plan = plan(&instances, day(10), &settings);
        assert_eq!(plan.keep.len(), 6);
        assert_eq!(removed(&plan).len(), 4);
        assert_eq!(names(&plan.keep)[0], "nextcloud_20240105_020000_full");
    }

    #[test]
    fn chains_are_kept_whole() {
        let dir = tempfile::tempdir().unwrap();
        let full_old = make(dir.path(), day(0), BackupKind::Full, None);
        let incr_old = make(dir.path(), day(1), BackupKind::Incremental, Some(&full_old));
        let full = make(dir.path(), day(10), BackupKind::Full, None);
        let incr1 = make(dir.path(), day(11), BackupKind::Incremental, Some(&full));
        let incr2 = make(dir.path(), day(12), BackupKind::Incremental, Some(&incr1));
        let instances = vec![full_old, incr_old, full, incr1, incr2];
        let settings = RetentionSettings {
            keep_all_days: 0,
            keep_chains: 1,
            calendar: None,
        };

        let plan = plan(&instances, day(100), &settings);
        assert_eq!(
            names(&plan.keep),
            vec![
                "nextcloud_20240111_020000_full",
                "nextcloud_20240112_020000_incr",
                "nextcloud_20240113_020000_incr",
            ]
        );
        assert_eq!(
            removed(&plan),
            vec!["nextcloud_20240101_020000_full", "nextcloud_20240102_020000_incr"]
        );
    }

    #[test]
    fn newest_full_survives_even_when_expired() {
        let dir = tempfile::tempdir().unwrap();
        let full = make(dir.path(), day(0), BackupKind::Full, None);
        let instances = vec![full];
        let settings = RetentionSettings {
            keep_all_days: 0,
            keep_chains: 0,
            calendar: None,
        };

        let plan = plan(&instances, day(365), &settings);
        assert_eq!(plan.keep.len(), 1);
        assert!(plan.remove.is_empty());
    }

    #[test]
    fn orphans_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let gone = make(dir.path(), day(0), BackupKind::Full, None);
        let orphan = make(dir.path(), day(1), BackupKind::Incremental, Some(&gone));
        let full = make(dir.path(), day(2), BackupKind::Full, None);
        let instances = vec![orphan, full];

        let plan = plan(&instances, day(3), &RetentionSettings::default());
        assert_eq!(names(&plan.keep), vec!["nextcloud_20240103_020000_full"]);
        assert_eq!(plan.remove.len(), 1);
        assert_eq!(plan.remove[0].1, PruneReason::Orphaned);
    }

    #[test]
    fn no_surviving_incremental_loses_its_base() {
        let dir = tempfile::tempdir().unwrap();
        let mut instances = Vec::new();
        // a full backup every 5 days with daily incrementals in between
        for n in 0..60 {
            let instance = if n % 5 == 0 {
                make(dir.path(), day(n), BackupKind::Full, None)
            } else {
                make(dir.path(), day(n), BackupKind::Incremental, instances.last())
            };
            instances.push(instance);
        }
        let settings = RetentionSettings {
            keep_all_days: 7,
            keep_chains: 3,
            calendar: None,
        };

        let plan = plan(&instances, day(61), &settings);
        let kept: HashSet<_> = names(&plan.keep).into_iter().collect();
        for instance in &plan.keep {
            if let Some(base) = instance.base() {
                assert!(kept.contains(base), "{} lost its base", instance.name());
            }
        }
        assert!(kept.contains("nextcloud_20240225_020000_full"));
        assert_eq!(plan.keep.len() + plan.remove.len(), 60);
    }

    #[test]
    fn calendar_keeps_monthly_chains() {
        let dir = tempfile::tempdir().unwrap();
        let instances: Vec<_> = (0..90)
            .map(|n| make(dir.path(), day(n), BackupKind::Full, None))
            .collect();
        let settings = RetentionSettings {
            keep_all_days: 0,
            keep_chains: 1,
            calendar: Some(CalendarRetention {
                daily: Some(0),
                weekly: Some(0),
                monthly: Some(3),
                quarterly: Some(0),
                yearly: Some(0),
            }),
        };

        let plan = plan(&instances, day(200), &settings);
        // newest backup of March, February and January
        assert_eq!(
            names(&plan.keep),
            vec![
                "nextcloud_20240131_020000_full",
                "nextcloud_20240229_020000_full",
                "nextcloud_20240330_020000_full",
            ]
        );
    }
}
