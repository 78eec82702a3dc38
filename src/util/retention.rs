use std::collections::HashSet;

use chrono::Datelike;

/// Calendar based retention ("grandfather-father-son").
///
/// Every field counts periods, not backups: `daily: Some(7)` keeps the newest
/// backup of each of the seven most recent days that have one. A [None]
/// field keeps the newest backup of every period of that type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct CalendarRetention {
    /// Defines how many daily backups to keep.
    pub daily: Option<usize>,

    /// Defines how many weekly backups to keep.
    ///
    /// Weeks are ISO weeks.
    pub weekly: Option<usize>,

    /// Defines how many monthly backups to keep.
    pub monthly: Option<usize>,

    /// Defines how many quarterly backups to keep.
    pub quarterly: Option<usize>,

    /// Defines how many yearly backups to keep.
    pub yearly: Option<usize>,
}

/// Stateful selector applying a [CalendarRetention].
///
/// Feed dates newest first: the first date seen for a period claims it.
#[derive(Clone, Debug)]
pub struct CalendarSelector {
    config: CalendarRetention,
    daily: HashSet<(i32, u32)>,
    weekly: HashSet<(i32, u32)>,
    monthly: HashSet<(i32, u32)>,
    quarterly: HashSet<(i32, u32)>,
    yearly: HashSet<(i32, u32)>,
}

impl From<CalendarRetention> for CalendarSelector {
    fn from(config: CalendarRetention) -> Self {
        Self::new(config)
    }
}

fn claim(limit: Option<usize>, seen: &mut HashSet<(i32, u32)>, key: (i32, u32)) -> bool {
    limit.is_none_or(|limit| seen.len() < limit) && seen.insert(key)
}

impl CalendarSelector {
    pub fn new(config: CalendarRetention) -> Self {
        Self {
            config,
            daily: HashSet::new(),
            weekly: HashSet::new(),
            monthly: HashSet::new(),
            quarterly: HashSet::new(),
            yearly: HashSet::new(),
        }
    }

    /// Returns if the [Datelike] claims a period that is still to be retained.
    pub fn retain(&mut self, date: impl Datelike) -> bool {
        let Self {
            config,
            daily,
            weekly,
            monthly,
            quarterly,
            yearly,
        } = self;

        // evaluate every period, a date may claim several at once
        let claims = [
            claim(config.daily, daily, (date.year(), date.ordinal())),
            claim(
                config.weekly,
                weekly,
                (date.iso_week().year(), date.iso_week().week()),
            ),
            claim(config.monthly, monthly, (date.year(), date.month())),
            claim(config.quarterly, quarterly, (date.year(), date.quarter())),
            claim(config.yearly, yearly, (date.year(), 0)),
        ];

        claims.into_iter().any(|claimed| claimed)
    }
}
