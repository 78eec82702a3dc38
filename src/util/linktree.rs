//! Native directory snapshots with hard links against a base tree.
//!
//! A file is considered unchanged if its size and modification time match the
//! file at the same relative path in the base tree. Unchanged files are hard
//! linked, everything else is copied with its modification time preserved so
//! the next snapshot can link against it again.

use std::fs::{self, File, FileTimes};
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

use walkdir::WalkDir;

/// Counters of a [snapshot] run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub files_copied: u64,
    pub files_linked: u64,
    pub bytes_copied: u64,
}

/// Copies the tree `src` into `dst`, hard-linking files unchanged in `base`.
///
/// `dst` is created if missing.
pub fn snapshot(src: &Path, dst: &Path, base: Option<&Path>) -> io::Result<LinkStats> {
    let mut stats = LinkStats::default();
    copy_tree(src, dst, base, &mut stats)?;
    log::debug!(
        target: "util::linktree",
        "Snapshot of {}: {} copied ({} bytes), {} linked",
        src.display(),
        stats.files_copied,
        stats.bytes_copied,
        stats.files_linked
    );

    Ok(stats)
}

/// Makes `dst` an exact copy of `src`, removing everything else in `dst`.
///
/// `dst` itself is kept, it may be a mount point.
pub fn mirror(src: &Path, dst: &Path) -> io::Result<LinkStats> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(dst)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }

    snapshot(src, dst, None)
}

fn copy_tree(src: &Path, dst: &Path, base: Option<&Path>, stats: &mut LinkStats) -> io::Result<()> {
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        let src_path = entry.path();
        let relative = src_path.strip_prefix(src).map_err(io::Error::other)?;
        let dst_path = dst.join(relative);

        if file_type.is_dir() {
            fs::create_dir_all(&dst_path)?;
            dirs.push((dst_path, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            symlink(fs::read_link(src_path)?, &dst_path)?;
        } else if file_type.is_file() {
            let meta = entry.metadata()?;
            let base_path = base.map(|base| base.join(relative));
            match base_path.filter(|base_path| is_unchanged(&meta, base_path)) {
                Some(base_path) => {
                    fs::hard_link(&base_path, &dst_path)?;
                    stats.files_linked += 1;
                }
                None => {
                    stats.bytes_copied += fs::copy(src_path, &dst_path)?;
                    File::options()
                        .write(true)
                        .open(&dst_path)?
                        .set_times(FileTimes::new().set_modified(meta.modified()?))?;
                    stats.files_copied += 1;
                }
            }
        } else {
            log::debug!(target: "util::linktree", "Skipping special file {}", src_path.display());
        }
    }

    // once filled, as the source mode may be read-only
    for (dir, permissions) in dirs.into_iter().rev() {
        fs::set_permissions(dir, permissions)?;
    }

    Ok(())
}

fn is_unchanged(meta: &fs::Metadata, base_path: &Path) -> bool {
    let Ok(base_meta) = fs::symlink_metadata(base_path) else {
        return false;
    };

    base_meta.is_file()
        && base_meta.len() == meta.len()
        && matches!((base_meta.modified(), meta.modified()), (Ok(a), Ok(b)) if a == b)
}
