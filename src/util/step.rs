//! Retried, time-limited and journaled units of work.
//!
//! A step moves through `pending → running → {succeeded, failed, skipped}`.
//! The [Journal] remembers the state of every step key; a key that already
//! succeeded is skipped when it is run again.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use derive_more::Display;

/// File name of a persisted [Journal] inside a backup.
pub const JOURNAL_FILE: &str = "steps.json";

/// Boxed error of a failed step attempt.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("skipped")]
    Skipped,
}

/// Timeout and retry behaviour of steps.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StepPolicy {
    /// Seconds a single attempt may take. No limit if `false`.
    #[serde(with = "crate::settings::or_false")]
    pub timeout_secs: Option<u64>,
    /// Additional attempts after the first one failed.
    pub retries: u32,
    /// Wait before the n-th retry is `n * backoff_secs`.
    pub backoff_secs: u64,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: Some(6 * 60 * 60),
            retries: 2,
            backoff_secs: 30,
        }
    }
}

impl StepPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Same limits but a single attempt.
    ///
    /// Used for steps that mutate live state and must not be repeated blindly.
    pub fn once(self) -> Self {
        Self { retries: 0, ..self }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_secs.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StepRecord {
    pub state: StepState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A step failed on its last attempt.
#[derive(Debug)]
pub struct StepError {
    pub key: String,
    pub attempts: u32,
    pub source: BoxError,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Step `{}` failed after {} attempt(s): {}",
            self.key, self.attempts, self.source
        )
    }
}

impl StdError for StepError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Bookkeeping of the steps of one run.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Journal {
    steps: BTreeMap<String, StepRecord>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Journal {
    /// A journal that isn't written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the journal at `path`, starting empty if it doesn't exist.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut journal = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(io::Error::other)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e),
        };
        journal.path = Some(path.to_path_buf());
        journal.persist();

        Ok(journal)
    }

    pub fn state(&self, key: &str) -> StepState {
        self.steps
            .get(key)
            .map_or(StepState::Pending, |record| record.state)
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &StepRecord)> {
        self.steps.iter().map(|(key, record)| (key.as_str(), record))
    }

    /// Keys of all failed steps.
    pub fn failed(&self) -> Vec<&str> {
        self.records()
            .filter(|(_, record)| record.state == StepState::Failed)
            .map(|(key, _)| key)
            .collect()
    }

    /// Marks `key` as skipped without running anything.
    pub fn skip(&mut self, key: &str, reason: &str) {
        log::info!(target: "util::step", "Skipping step `{key}`: {reason}");
        self.record(
            key,
            StepRecord {
                state: StepState::Skipped,
                attempts: 0,
                error: None,
            },
        );
    }

    /// Runs the step `key`.
    ///
    /// `f` receives the per-attempt timeout and is attempted up to
    /// `1 + policy.retries` times. Returns `Ok(None)` if the key already
    /// succeeded earlier.
    pub fn run<T, E>(
        &mut self,
        key: &str,
        policy: &StepPolicy,
        mut f: impl FnMut(Option<Duration>) -> Result<T, E>,
    ) -> Result<Option<T>, StepError>
    where
        E: Into<BoxError>,
    {
        if self.state(key) == StepState::Succeeded {
            log::info!(target: "util::step", "Step `{key}` already succeeded, skipping");
            return Ok(None);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.record(
                key,
                StepRecord {
                    state: StepState::Running,
                    attempts: attempt,
                    error: None,
                },
            );
            log::debug!(target: "util::step", "Step `{key}`: attempt {attempt}");

            match f(policy.timeout()) {
                Ok(value) => {
                    self.record(
                        key,
                        StepRecord {
                            state: StepState::Succeeded,
                            attempts: attempt,
                            error: None,
                        },
                    );
                    return Ok(Some(value));
                }
                Err(e) => {
                    let e: BoxError = e.into();
                    if attempt > policy.retries {
                        log::error!(target: "util::step", "Step `{key}` failed: {e}");
                        self.record(
                            key,
                            StepRecord {
                                state: StepState::Failed,
                                attempts: attempt,
                                error: Some(e.to_string()),
                            },
                        );
                        return Err(StepError {
                            key: key.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let wait = policy.backoff(attempt);
                    log::warn!(
                        target: "util::step",
                        "Step `{key}` attempt {attempt} failed, retrying in {}s: {e}",
                        wait.as_secs()
                    );
                    thread::sleep(wait);
                }
            }
        }
    }

    fn record(&mut self, key: &str, record: StepRecord) {
        self.steps.insert(key.to_string(), record);
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let written = serde_json::to_vec_pretty(self)
            .map_err(io::Error::other)
            .and_then(|json| fs::write(path, json));
        if let Err(e) = written {
            log::warn!(target: "util::step", "Unable to write step journal {}: {e}", path.display());
        }
    }
}
