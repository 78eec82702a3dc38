//! Implements backup of the data and apps directories using [Files].

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use derive_more::{Display, Error, From};

use super::{Backup, Destination, Restore};
use crate::backup::instance::{APPS_DIR, DATA_DIR};
use crate::nextcloud::{Nextcloud, OccError};
use crate::util::command::{self, CommandError};
use crate::util::linktree;

/// Engine used to copy directory trees.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMethod {
    /// `rsync -a --delete`, incremental through `--link-dest`.
    #[default]
    Rsync,
    /// Built-in walker, see [linktree].
    Native,
}

/// Which directory of the installation is copied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tree {
    Data,
    Apps,
}

#[derive(Debug, Display, Error, From)]
pub enum FilesError {
    #[display("Copying files failed: {_0}")]
    #[from]
    Io(io::Error),
    #[from]
    Occ(OccError),
    #[display("rsync failed: {_0}")]
    #[from]
    Command(CommandError),
    #[display("Directory to restore from is missing: {}", _0.display())]
    Missing(#[error(ignore)] PathBuf),
}

/// The [Files] backend copies a directory tree of the installation.
///
/// With a base backup, files unchanged since the base are hard linked to it
/// instead of being copied again.
#[derive(Debug, Clone)]
pub struct Files {
    tree: Tree,
    method: CopyMethod,
}

impl Files {
    pub fn data(method: CopyMethod) -> Self {
        Self {
            tree: Tree::Data,
            method,
        }
    }

    pub fn apps(method: CopyMethod) -> Self {
        Self {
            tree: Tree::Apps,
            method,
        }
    }

    fn subdir(&self) -> &'static str {
        match self.tree {
            Tree::Data => DATA_DIR,
            Tree::Apps => APPS_DIR,
        }
    }

    fn live_dir(&self, nextcloud: &Nextcloud) -> Result<PathBuf, OccError> {
        match self.tree {
            Tree::Data => nextcloud.data_directory(),
            Tree::Apps => Ok(nextcloud.apps_dir()),
        }
    }
}

/// `path` with a trailing slash, so rsync copies the contents.
fn contents(path: &Path) -> OsString {
    let mut arg = path.as_os_str().to_owned();
    if !arg.to_string_lossy().ends_with('/') {
        arg.push("/");
    }
    arg
}

fn rsync(
    src: &Path,
    dst: &Path,
    link_dest: Option<&Path>,
    dry_run: bool,
    timeout: Option<Duration>,
) -> Result<(), FilesError> {
    let mut cmd = Command::new("rsync");
    cmd.arg("-a").arg("--delete");
    if dry_run {
        cmd.arg("--dry-run");
    }
    if let Some(link_dest) = link_dest {
        // relative --link-dest paths are resolved against the destination
        let mut arg = OsString::from("--link-dest=");
        arg.push(std::path::absolute(link_dest)?);
        cmd.arg(arg);
    }
    cmd.arg(contents(src)).arg(contents(dst));

    let output = command::run(&mut cmd, timeout)?;
    for line in output.stdout.lines() {
        log::trace!(target: "backend::files", "rsync: {line}");
    }
    Ok(())
}

/// Removes what a failed earlier attempt left at `dst`.
pub(super) fn remove_leftover(dst: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dst) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Backup for Files {
    type Error = FilesError;

    fn name(&self) -> &'static str {
        self.subdir()
    }

    fn backup(
        &self,
        nextcloud: &Nextcloud,
        dest: &Destination<'_>,
        dry_run: bool,
    ) -> Result<(), Self::Error> {
        let src = self.live_dir(nextcloud)?;
        let dst = dest.root.join(self.subdir());
        let base = dest
            .base
            .map(|base| base.join(self.subdir()))
            .filter(|base| base.is_dir());
        match &base {
            Some(base) => log::info!(
                target: "backend::files",
                "Incremental copy of {} against {}",
                src.display(),
                base.display()
            ),
            None => log::info!(target: "backend::files", "Full copy of {}", src.display()),
        }

        match self.method {
            CopyMethod::Rsync if dry_run => rsync(&src, &dst, None, true, dest.timeout)?,
            CopyMethod::Rsync => rsync(&src, &dst, base.as_deref(), false, dest.timeout)?,
            CopyMethod::Native if dry_run => {
                std::fs::read_dir(&src)?;
            }
            CopyMethod::Native => {
                remove_leftover(&dst)?;
                let stats = linktree::snapshot(&src, &dst, base.as_deref())?;
                log::info!(
                    target: "backend::files",
                    "Copied {} files ({} bytes), linked {} unchanged files",
                    stats.files_copied,
                    stats.bytes_copied,
                    stats.files_linked
                );
            }
        }

        log::info!(target: "backend::files", "Finished backup of {}", self.subdir());
        Ok(())
    }
}

impl Restore for Files {
    fn restore(
        &self,
        nextcloud: &Nextcloud,
        source: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), Self::Error> {
        let src = source.join(self.subdir());
        if !src.is_dir() {
            return Err(FilesError::Missing(src));
        }
        let dst = self.live_dir(nextcloud)?;
        log::info!(target: "backend::files", "Restore {} into {}", src.display(), dst.display());

        match self.method {
            CopyMethod::Rsync => rsync(&src, &dst, None, false, timeout)?,
            CopyMethod::Native => {
                linktree::mirror(&src, &dst)?;
            }
        }

        log::info!(target: "backend::files", "Finished restore of {}", self.subdir());
        Ok(())
    }
}
