//! Bookkeeping of backups on disk.
//!
//! Every backup is a directory `<prefix>_<YYYYMMDD_HHMMSS>_<full|incr>` in the
//! backup root with the subdirectories `database`, `data`, `config` and
//! optionally `apps` and `redis`.

pub mod chain;
pub mod instance;
pub mod plan;
pub mod prune;
pub mod repository;

pub use instance::{BackupInstance, BackupKind, BackupMetadata, BackupName};
pub use plan::BackupPlan;
pub use prune::RetentionSettings;
pub use repository::{PartialBackup, Repository, RepositoryError};
