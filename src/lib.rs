//! Library to backup, restore and prune backups of your [Nextcloud][nc]
//! installation.
//!
//! The library tries to follow the [official backup guidelines][nc_backup].
//! The different backup modules are located in the [`backends`] module, the
//! bookkeeping of backups on disk in [`backup`] and the subcommands of the
//! binary in [`actions`].
//!
//! [nc]: https://nextcloud.com/
//! [nc_backup]: https://docs.nextcloud.com/server/latest/admin_manual/maintenance/backup.html

#![forbid(unsafe_code)]

pub mod actions;
pub mod archive;
pub mod backends;
pub mod backup;
pub mod cli;
pub mod nextcloud;
pub mod remote;
pub mod settings;
pub mod util;
