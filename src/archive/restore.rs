// src/archive/restore.rs

//! Archive restore pipeline (`.prefix` / `.bottle` / `.wzt`)
//!
//! The mirror of [`super::create`]: a space pre-check, extraction with
//! the reverse name transform, then host-side normalization of registry
//! files, shell folders and descriptors. An existing prefix with the
//! same name is moved aside first and comes back if the restore fails.

use super::rewrite::{self, Sentinel, USERNAME_TOKEN};
use super::{list_entries, top_level_name, unpack, Flavor};
use crate::catalog::Catalog;
use crate::descriptor::{Descriptor, CHARM_EXT};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::notify::Notifier;
use crate::paths::{host_user, DataRoot};
use crate::prefix::PrefixBuilder;
use crate::settings::Settings;
use crate::task::TaskControl;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Compressed-size multiplier for the cheap space estimate. Only when
/// this estimate does not fit is the archive walked for exact sizes.
const SPACE_FACTOR: u64 = 4;

/// Restore an archive into the prefixes root and merge its descriptors
/// into the catalog. Returns the restored prefix directory.
pub fn restore_archive(
    archive: &Path,
    root: &DataRoot,
    settings: &Settings,
    catalog: &mut Catalog,
    ctl: &TaskControl,
    notifier: &dyn Notifier,
) -> Result<PathBuf> {
    let flavor = Flavor::from_path(archive)
        .ok_or_else(|| Error::invalid("restore", "unrecognized archive extension"))?;
    let user = host_user()?;

    notifier.status("Checking disk space...");
    check_space(archive, &root.prefixes_dir())?;

    let name = top_level_name(archive)?;
    let target = root.prefixes_dir().join(&name);

    // An existing prefix of the same name is moved aside, not merged
    let displaced = if target.exists() {
        Some(fsutil::move_to_backup(&target)?)
    } else {
        None
    };

    let result = restore_steps(
        archive, flavor, &target, &user, root, settings, catalog, ctl, notifier,
    );
    match result {
        Ok(()) => {
            info!("restored {} to {}", archive.display(), target.display());
            notifier.status("Restore complete");
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

#[allow(clippy::too_many_arguments)]
fn restore_steps(
    archive: &Path,
    flavor: Flavor,
    target: &Path,
    user: &str,
    root: &DataRoot,
    settings: &Settings,
    catalog: &mut Catalog,
    ctl: &TaskControl,
    notifier: &dyn Notifier,
) -> Result<()> {
    ctl.check()?;
    notifier.status("Extracting archive...");
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::invalid("restore", "target has no name"))?;
    let transform = reverse_transform(flavor, user);
    unpack(
        archive,
        &root.prefixes_dir(),
        &transform,
        Some(&name),
        &ctl.stop_flag(),
    )?;

    ctl.check()?;
    notifier.status("Adapting to this machine...");
    rewrite::reg_token_to_user(target, user)?;
    if flavor == Flavor::Legacy {
        let mut values = HashMap::new();
        values.insert(Sentinel::User, user.to_string());
        values.insert(Sentinel::PrefixPath, target.to_string_lossy().into_owned());
        values.insert(
            Sentinel::ConfigPath,
            root.root().to_string_lossy().into_owned(),
        );
        rewrite::replace_wzt_sentinels(target, &values)?;
    }
    fsutil::realize_user_shell_dirs(&target.join("drive_c").join("users").join(user))?;
    fsutil::merge_foreign_user_dirs(target, user)?;
    rebase_descriptors(target)?;

    ctl.check()?;
    notifier.status("Registering shortcuts...");
    let builder = PrefixBuilder::new(root, settings);
    if flavor == Flavor::Legacy {
        // Legacy backups carry no descriptors, only Windows shortcuts
        builder.consume_lnk_files(target, catalog, notifier)?;
    }
    for descriptor in Catalog::load(target)?.iter() {
        catalog.put_front(descriptor.clone());
    }
    Ok(())
}

/// Entry-name rewriting applied while extracting: the portable user
/// token (and, for legacy archives, the legacy user sentinel) becomes
/// the host account name.
fn reverse_transform(flavor: Flavor, user: &str) -> impl Fn(&Path) -> Option<PathBuf> {
    let user = user.to_string();
    move |p: &Path| {
        let s = p.to_string_lossy();
        let mut out = s.replace(USERNAME_TOKEN, &user);
        if flavor == Flavor::Legacy {
            out = out.replace("XOUSERXO", &user);
        }
        if out == s {
            None
        } else {
            Some(PathBuf::from(out))
        }
    }
}

/// Refuse a restore that cannot fit. The cheap check multiplies the
/// compressed size; only when that fails is the archive walked for the
/// exact uncompressed total.
fn check_space(archive: &Path, dest: &Path) -> Result<()> {
    let compressed = fs::metadata(archive)?.len();
    let available = fsutil::free_space(dest)?;
    let estimate = compressed.saturating_mul(SPACE_FACTOR);
    if estimate <= available {
        return Ok(());
    }
    let exact: u64 = list_entries(archive)?.iter().map(|(_, size)| size).sum();
    debug!(
        "space estimate {} over budget, exact requirement is {}",
        estimate, exact
    );
    if exact <= available {
        return Ok(());
    }
    Err(Error::InsufficientSpace {
        required: exact,
        available,
    })
}

/// Point every restored descriptor at its new home: `wineprefix` and
/// `script_path` move to the restored directory, and `exe_file` (and a
/// bundled runner) that lived inside the old prefix follow it.
fn rebase_descriptors(target: &Path) -> Result<()> {
    let charms: Vec<PathBuf> = WalkDir::new(target)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|x| x == CHARM_EXT).unwrap_or(false))
        .collect();

    for charm in charms {
        let mut descriptor = match Descriptor::load(&charm) {
            Ok(d) => d,
            Err(e) => {
                warn!("skipping restored descriptor {}: {}", charm.display(), e);
                continue;
            }
        };
        let old_prefix = descriptor.wineprefix.clone();
        descriptor.wineprefix = target.to_path_buf();
        descriptor.script_path = charm.clone();
        if old_prefix != target {
            if let Ok(rel) = descriptor.exe_file.strip_prefix(&old_prefix) {
                descriptor.exe_file = target.join(rel);
            }
            let runner = PathBuf::from(&descriptor.runner);
            if let Ok(rel) = runner.strip_prefix(&old_prefix) {
                descriptor.runner = target.join(rel).to_string_lossy().into_owned();
            }
        }
        descriptor.save()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::create::{create_archive, CreateOptions};
    use crate::archive::pack;
    use crate::archive::PackSource;
    use crate::notify::SilentNotifier;
    use tempfile::TempDir;

    const HASH: &str = "abc0000000000000000000000000000000000000000000000000000000000000";

    fn setup(tmp: &TempDir) -> (DataRoot, Settings) {
        let root = DataRoot::at(tmp.path().join("wc")).unwrap();
        (root, Settings::default())
    }

    fn archived_prefix(tmp: &TempDir, root: &DataRoot) -> PathBuf {
        let user = host_user().unwrap();
        let prefix = root.prefixes_dir().join("setup-abc0000000");
        fs::create_dir_all(prefix.join(format!("drive_c/users/{user}"))).unwrap();
        fs::write(
            prefix.join("user.reg"),
            format!("\"Desktop\"=\"C:\\\\users/{user}\\\\Desktop\"\n"),
        )
        .unwrap();
        let exe = prefix.join("drive_c/setup.exe");
        fs::write(&exe, b"MZ").unwrap();
        let d = Descriptor {
            sha256sum: HASH.into(),
            exe_file: exe,
            script_path: prefix.join("Setup.charm"),
            wineprefix: prefix.clone(),
            progname: "Setup".into(),
            args: String::new(),
            env_vars: String::new(),
            runner: String::new(),
            wine_debug: String::new(),
            mtime: None,
        };
        d.save().unwrap();

        let archive = tmp.path().join("setup.prefix");
        create_archive(
            &prefix,
            &archive,
            &CreateOptions {
                flavor: Flavor::Prefix,
                runners_root: &root.runners_dir(),
            },
            &TaskControl::new(),
            &SilentNotifier,
        )
        .unwrap();
        fs::remove_dir_all(&prefix).unwrap();
        archive
    }

    #[test]
    fn roundtrip_restores_prefix_and_catalog_entry() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let archive = archived_prefix(&tmp, &root);
        let user = host_user().unwrap();

        let mut catalog = Catalog::new();
        let restored = restore_archive(
            &archive,
            &root,
            &settings,
            &mut catalog,
            &TaskControl::new(),
            &SilentNotifier,
        )
        .unwrap();

        assert_eq!(restored, root.prefixes_dir().join("setup-abc0000000"));
        // Registry carries this machine's user again
        let reg = fs::read_to_string(restored.join("user.reg")).unwrap();
        assert!(reg.contains(&format!("users/{user}")));
        assert!(!reg.contains("%USERNAME%"));
        // The user directory exists under the host account
        assert!(restored
            .join(format!("drive_c/users/{user}"))
            .is_dir());
        // Descriptor merged and rebased
        let d = catalog.get(HASH).unwrap();
        assert_eq!(d.wineprefix, restored);
        assert!(d.exe_file.starts_with(&restored));
    }

    #[test]
    fn existing_prefix_is_displaced_not_merged() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let archive = archived_prefix(&tmp, &root);

        let target = root.prefixes_dir().join("setup-abc0000000");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("marker"), b"old").unwrap();

        let mut catalog = Catalog::new();
        restore_archive(
            &archive,
            &root,
            &settings,
            &mut catalog,
            &TaskControl::new(),
            &SilentNotifier,
        )
        .unwrap();

        // The restored tree replaced the old one; the old one survives
        // as a backup sibling
        assert!(!target.join("marker").exists());
        let backups: Vec<_> = fs::read_dir(root.prefixes_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("setup-abc0000000_backup_")
            })
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn cancelled_restore_brings_old_prefix_back() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let archive = archived_prefix(&tmp, &root);

        let target = root.prefixes_dir().join("setup-abc0000000");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("marker"), b"old").unwrap();

        let ctl = TaskControl::new();
        ctl.cancel();
        let mut catalog = Catalog::new();
        assert!(matches!(
            restore_archive(
                &archive,
                &root,
                &settings,
                &mut catalog,
                &ctl,
                &SilentNotifier,
            ),
            Err(Error::Cancelled)
        ));
        assert_eq!(fs::read_to_string(target.join("marker")).unwrap(), "old");
    }

    #[test]
    fn crafted_second_top_level_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);

        let pfx = tmp.path().join("stage/game-abc0000000");
        fs::create_dir_all(pfx.join("drive_c")).unwrap();
        fs::write(pfx.join("drive_c/a.txt"), b"a").unwrap();
        let sneaky = tmp.path().join("stage/sneaky");
        fs::create_dir_all(&sneaky).unwrap();
        fs::write(sneaky.join("payload"), b"x").unwrap();

        let archive = tmp.path().join("game.prefix");
        pack(
            &archive,
            &[
                PackSource {
                    dir: pfx,
                    rel: PathBuf::from("game-abc0000000"),
                },
                PackSource {
                    dir: sneaky,
                    rel: PathBuf::from("sneaky"),
                },
            ],
            &|_| None,
            &crate::task::StopFlag::new(),
        )
        .unwrap();

        let mut catalog = Catalog::new();
        assert!(matches!(
            restore_archive(
                &archive,
                &root,
                &settings,
                &mut catalog,
                &TaskControl::new(),
                &SilentNotifier,
            ),
            Err(Error::Invalid { .. })
        ));
        // Neither the partial prefix nor the foreign tree survives
        assert!(!root.prefixes_dir().join("game-abc0000000").exists());
        assert!(!root.prefixes_dir().join("sneaky").exists());
    }

    #[test]
    fn unknown_extension_rejected() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let bogus = tmp.path().join("a.tar");
        fs::write(&bogus, b"x").unwrap();
        let mut catalog = Catalog::new();
        assert!(matches!(
            restore_archive(
                &bogus,
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
    fn legacy_archive_resolves_sentinels_and_shortcuts() {
        let tmp = TempDir::new().unwrap();
        let (root, settings) = setup(&tmp);
        let user = host_user().unwrap();

        // A hand-built legacy tree: sentinel user dir, sentinel reg
        // text, no descriptors, one Windows shortcut
        let stage = tmp.path().join("stage/demo-wzt");
        fs::create_dir_all(stage.join("drive_c/users/XOUSERXO")).unwrap();
        fs::write(
            stage.join("user.reg"),
            "\"Desktop\"=\"C:\\\\users\\\\XOUSERXO\\\\Desktop\"\nprefix=XOPREFIXXO\n",
        )
        .unwrap();
        let game = stage.join("drive_c/Games/Demo");
        fs::create_dir_all(&game).unwrap();
        fs::write(game.join("demo.exe"), b"MZ demo").unwrap();
        let mut lnk = vec![0x4Cu8, 0, 0, 0];
        lnk.extend_from_slice(b"\x01C:\\Games\\Demo\\demo.exe\x00");
        fs::write(stage.join("Demo.lnk"), &lnk).unwrap();

        let archive = tmp.path().join("demo.wzt");
        pack(
            &archive,
            &[PackSource {
                dir: stage,
                rel: PathBuf::from("demo-wzt"),
            }],
            &|_| None,
            &crate::task::StopFlag::new(),
        )
        .unwrap();

        let mut catalog = Catalog::new();
        let restored = restore_archive(
            &archive,
            &root,
            &settings,
            &mut catalog,
            &TaskControl::new(),
            &SilentNotifier,
        )
        .unwrap();

        // Sentinels resolved in names and contents
        assert!(restored.join(format!("drive_c/users/{user}")).is_dir());
        let reg = fs::read_to_string(restored.join("user.reg")).unwrap();
        assert!(reg.contains(&user));
        assert!(reg.contains(&restored.to_string_lossy().into_owned()));
        assert!(!reg.contains("XOUSERXO"));
        // A descriptor synthesized from the shortcut
        assert_eq!(catalog.len(), 1);
        let d = catalog.iter().next().unwrap();
        assert!(d.exe_file.ends_with("drive_c/Games/Demo/demo.exe"));
    }
}
