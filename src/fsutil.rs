// src/fsutil.rs

//! Filesystem helpers shared by the template, prefix and archive code
//!
//! Everything here is symlink-aware: Wine prefixes are full of
//! symlinks (user shell folders, dosdevices) that must be carried
//! verbatim by copies and replaced by real directories only at the
//! well-defined points the lifecycle calls for.

use crate::error::{Error, Result};
use crate::task::StopFlag;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// User shell folders that wineboot seeds as symlinks into `$HOME`
pub const USER_SHELL_DIRS: &[&str] = &[
    "Desktop",
    "Documents",
    "Downloads",
    "Music",
    "Pictures",
    "Videos",
    "Templates",
];

/// Recursively copy `src` into `dst`, preserving symlinks verbatim and
/// never overwriting existing entries. Cancelable between entries.
pub fn copy_tree(src: &Path, dst: &Path, stop: &StopFlag) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::not_found(src));
    }
    for entry in WalkDir::new(src).follow_links(false) {
        stop.check()?;
        let entry = entry.map_err(|e| {
            Error::invalid("copy source", format!("{}: {}", src.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| Error::invalid("copy source", "walk escaped the source root"))?;
        if rel.as_os_str().is_empty() {
            fs::create_dir_all(dst)?;
            continue;
        }
        let target = dst.join(rel);
        let ftype = entry.file_type();
        if ftype.is_symlink() {
            if target.symlink_metadata().is_ok() {
                continue;
            }
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target)?;
        } else if ftype.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if target.symlink_metadata().is_ok() {
                continue;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// `<path>_backup_<unix-ts>` sibling name for rollback moves
pub fn backup_sibling(path: &Path) -> PathBuf {
    let ts = chrono::Utc::now().timestamp();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup".into());
    path.with_file_name(format!("{name}_backup_{ts}"))
}

/// Move `path` aside to a backup sibling, returning the new location.
pub fn move_to_backup(path: &Path) -> Result<PathBuf> {
    let backup = backup_sibling(path);
    fs::rename(path, &backup)?;
    debug!("moved {} aside to {}", path.display(), backup.display());
    Ok(backup)
}

/// Bytes available to unprivileged writes on the filesystem of `path`
pub fn free_space(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| Error::invalid("statvfs", format!("{}: {}", path.display(), e)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Replace symlinked user shell directories with real directories so
/// later archives are self-contained. Applied to
/// `<prefix>/drive_c/users/<user>`.
pub fn realize_user_shell_dirs(user_dir: &Path) -> Result<()> {
    if !user_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(user_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.symlink_metadata()?.file_type().is_symlink() {
            continue;
        }
        let name = entry.file_name();
        let known = USER_SHELL_DIRS
            .iter()
            .any(|d| name.to_string_lossy() == *d);
        if !known {
            continue;
        }
        fs::remove_file(&path)?;
        fs::create_dir(&path)?;
        debug!("replaced symlink {} with a real directory", path.display());
    }
    Ok(())
}

/// Merge every `drive_c/users/<other>` subtree into the host user's,
/// renaming collisions to `<name>.old`. Used after restore so a prefix
/// archived under another account becomes usable here.
pub fn merge_foreign_user_dirs(prefix: &Path, host_user: &str) -> Result<()> {
    let users = prefix.join("drive_c").join("users");
    if !users.is_dir() {
        return Ok(());
    }
    let host_dir = users.join(host_user);
    fs::create_dir_all(&host_dir)?;

    for entry in fs::read_dir(&users)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == host_user || name == "Public" {
            continue;
        }
        let foreign = entry.path();
        if !foreign.is_dir() {
            continue;
        }
        debug!("merging foreign user dir {} into {}", name, host_user);
        merge_into(&foreign, &host_dir)?;
        fs::remove_dir_all(&foreign)?;
    }
    Ok(())
}

/// Move the contents of `src` into `dst`; existing entries in `dst`
/// are kept and the incoming one is renamed `<name>.old`.
fn merge_into(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let from = entry.path();
        if target.symlink_metadata().is_ok() {
            if target.is_dir() && from.is_dir() && !from.symlink_metadata()?.file_type().is_symlink()
            {
                merge_into(&from, &target)?;
                let _ = fs::remove_dir(&from);
                continue;
            }
            let mut renamed = target.as_os_str().to_owned();
            renamed.push(".old");
            let renamed = PathBuf::from(renamed);
            if renamed.symlink_metadata().is_ok() {
                warn!("collision backup {} already exists, skipping", renamed.display());
                continue;
            }
            fs::rename(&from, &renamed)?;
        } else {
            fs::rename(&from, &target)?;
        }
    }
    Ok(())
}

/// Remove a directory tree if it exists; missing targets are fine
pub fn remove_tree_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
