// src/archive/import.rs

//! Import an existing Wine directory from anywhere on disk
//!
//! Unlike restore, the source is a live directory rather than an
//! archive: it is copied under the prefixes root, its registry files
//! are re-pointed at the host account, and descriptors are synthesized
//! from whatever shortcuts the installer left behind.

use super::rewrite::TextEdits;
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::notify::Notifier;
use crate::paths::{host_user, DataRoot};
use crate::prefix::PrefixBuilder;
use crate::settings::Settings;
use crate::task::TaskControl;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Copy `src` under the prefixes root and adopt it as a prefix.
/// Returns the new prefix directory.
pub fn import_wine_directory(
    src: &Path,
    root: &DataRoot,
    settings: &Settings,
    catalog: &mut Catalog,
    ctl: &TaskControl,
    notifier: &dyn Notifier,
) -> Result<PathBuf> {
    if !src.join("drive_c").is_dir() {
        return Err(Error::invalid(
            "import",
            format!("{} is not a Wine directory (no drive_c)", src.display()),
        ));
    }
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::invalid("import", "source directory has no name"))?;
    let target = root.prefixes_dir().join(&name);
    if target == *src {
        return Err(Error::invalid("import", "directory is already a prefix"));
    }

    let displaced = if target.exists() {
        Some(fsutil::move_to_backup(&target)?)
    } else {
        None
    };

    let result = import_steps(src, &target, root, settings, catalog, ctl, notifier);
    match result {
        Ok(()) => {
            info!("imported {} as {}", src.display(), target.display());
            notifier.status("Import complete");
            Ok(target)
        }
        Err(e) => {
            let _ = fsutil::remove_tree_if_exists(&target);
            if let Some(backup) = displaced {
                if let Err(undo) = fs::rename(&backup, &target) {
                    warn!(
                        "cannot move {} back to {}: {}",
                        backup.display(),
                        target.display(),
                        undo
                    );
                }
            }
            Err(e)
        }
    }
}

fn import_steps(
    src: &Path,
    target: &Path,
    root: &DataRoot,
    settings: &Settings,
    catalog: &mut Catalog,
    ctl: &TaskControl,
    notifier: &dyn Notifier,
) -> Result<()> {
    notifier.status(&format!("Copying {}...", src.display()));
    fsutil::copy_tree(src, target, &ctl.stop_flag())?;

    ctl.check()?;
    notifier.status("Adapting to this account...");
    let user = host_user()?;
    for foreign in foreign_user_names(target, &user)? {
        debug!("re-pointing registry from user {} to {}", foreign, user);
        // One-way edits on the copy; the source stays untouched
        let mut throwaway = TextEdits::new();
        for reg in super::rewrite::reg_files(target) {
            throwaway.apply(&reg, &format!("users/{foreign}"), &format!("users/{user}"))?;
        }
    }
    fsutil::realize_user_shell_dirs(&target.join("drive_c").join("users").join(&user))?;
    fsutil::merge_foreign_user_dirs(target, &user)?;

    ctl.check()?;
    notifier.status("Registering shortcuts...");
    for descriptor in Catalog::load(target)?.iter() {
        catalog.put_front(descriptor.clone());
    }
    let builder = PrefixBuilder::new(root, settings);
    builder.consume_lnk_files(target, catalog, notifier)?;
    Ok(())
}

/// Account directories under `drive_c/users` other than the host's
fn foreign_user_names(prefix: &Path, host_user: &str) -> Result<Vec<String>> {
    let users = prefix.join("drive_c").join("users");
    let mut out = Vec::new();
    if !users.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(users)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != host_user && name != "Public" {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::SilentNotifier;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir) -> (DataRoot, Settings) {
        let root = DataRoot::at(tmp.path().join("wc")).unwrap();
        (root, Settings::default())
    }

    fn wine_dir(dir: &Path, name: &str, owner: &str) -> PathBuf {
        let src = dir.join(name);
        fs::create_dir_all(src.join(format!("drive_c/users/{owner}/Desktop"))).unwrap();
        fs::write(
            src.join("user.reg"),
            format!("\"Desktop\"=\"C:\\\\users/{owner}\\\\Desktop\"\n"),
        )
        .unwrap();
        src
    }

    #[test]
    fn import_copies_and_repoints_registry() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let src = wine_dir(tmp.path(), "oldwine", "someoneelse");
        let user = host_user().unwrap();

        let mut catalog = Catalog::new();
        let target = import_wine_directory(
            &src,
            &root,
            &settings,
            &mut catalog,
            &TaskControl::new(),
            &SilentNotifier,
        )
        .unwrap();

        assert_eq!(target, root.prefixes_dir().join("oldwine"));
        let reg = fs::read_to_string(target.join("user.reg")).unwrap();
        assert!(reg.contains(&format!("users/{user}")));
        assert!(!reg.contains("someoneelse"));
        assert!(target.join(format!("drive_c/users/{user}/Desktop")).is_dir());
        assert!(!target.join("drive_c/users/someoneelse").exists());
        // Source untouched
        assert!(fs::read_to_string(src.join("user.reg"))
            .unwrap()
            .contains("someoneelse"));
    }

    #[test]
    fn import_rejects_non_wine_directory() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let src = tmp.path().join("plain");
        fs::create_dir_all(&src).unwrap();
        let mut catalog = Catalog::new();
        assert!(matches!(
            import_wine_directory(
                &src,
                &root,
                &settings,
                &mut catalog,
                &TaskControl::new(),
                &SilentNotifier,
            ),
            Err(Error::Invalid { .. })
        ));
    }

    #[test]
    fn cancelled_import_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let src = wine_dir(tmp.path(), "oldwine", "x");

        let existing = root.prefixes_dir().join("oldwine");
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("marker"), b"old").unwrap();

        let ctl = TaskControl::new();
        ctl.cancel();
        let mut catalog = Catalog::new();
        assert!(matches!(
            import_wine_directory(
                &src,
                &root,
                &settings,
                &mut catalog,
                &ctl,
                &SilentNotifier,
            ),
            Err(Error::Cancelled)
        ));
        assert_eq!(
            fs::read_to_string(existing.join("marker")).unwrap(),
            "old"
        );
    }

    #[test]
    fn import_picks_up_shortcuts() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let user = host_user().unwrap();
        let src = wine_dir(tmp.path(), "gamewine", &user);
        let game = src.join("drive_c/Games/Demo");
        fs::create_dir_all(&game).unwrap();
        fs::write(game.join("demo.exe"), b"MZ demo").unwrap();
        let mut lnk = vec![0x4Cu8, 0, 0, 0];
        lnk.extend_from_slice(b"\x01C:\\Games\\Demo\\demo.exe\x00");
        fs::write(src.join("Demo.lnk"), &lnk).unwrap();

        let mut catalog = Catalog::new();
        let target = import_wine_directory(
            &src,
            &root,
            &settings,
            &mut catalog,
            &TaskControl::new(),
            &SilentNotifier,
        )
        .unwrap();

        assert_eq!(catalog.len(), 1);
        let d = catalog.iter().next().unwrap();
        assert!(d.exe_file.starts_with(&target));
        assert!(d.script_path.starts_with(&target));
    }
}
