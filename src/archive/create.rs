// src/archive/create.rs

//! Archive creation pipeline (`.prefix` / `.bottle`)
//!
//! A sequence of discrete, cancelable steps. Steps 1–5 make reversible
//! in-place text edits to the live prefix, step 6 streams the tar with
//! name transforms, step 7 reverts every edit so the prefix keeps
//! working in place. Cancellation at any point unlinks the partial
//! archive and reverts.

use super::rewrite::{self, TextEdits, USERNAME_TOKEN};
use super::{pack, Flavor, PackSource};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::paths::host_user;
use crate::task::TaskControl;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Bottle-only bundling decisions derived from the prefix's
/// descriptors
#[derive(Debug, Default)]
struct Bundles {
    /// External game directory and its in-archive dirname
    game_dir: Option<(PathBuf, String)>,
    /// Runner directory (under the runners root) and its name
    runner_dir: Option<(PathBuf, String)>,
}

pub struct CreateOptions<'a> {
    pub flavor: Flavor,
    /// Runners root; a descriptor runner below it gets bundled into a
    /// bottle
    pub runners_root: &'a Path,
}

/// Create a `.prefix` or `.bottle` archive of `prefix` at `dest`.
pub fn create_archive(
    prefix: &Path,
    dest: &Path,
    opts: &CreateOptions<'_>,
    ctl: &TaskControl,
    notifier: &dyn Notifier,
) -> Result<()> {
    if !prefix.is_dir() {
        return Err(Error::not_found(prefix));
    }
    if opts.flavor == Flavor::Legacy {
        return Err(Error::invalid("archive", "legacy flavor is import-only"));
    }
    let user = host_user()?;
    let mut edits = TextEdits::new();

    let result = create_steps(prefix, dest, opts, &user, &mut edits, ctl, notifier);

    // Step 7 (and the error path): the live prefix gets its bytes back
    edits.revert();
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn create_steps(
    prefix: &Path,
    dest: &Path,
    opts: &CreateOptions<'_>,
    user: &str,
    edits: &mut TextEdits,
    ctl: &TaskControl,
    notifier: &dyn Notifier,
) -> Result<()> {
    let name = prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::invalid("archive", "prefix has no name"))?;

    // 1. Home paths in descriptor-like files become `~`
    ctl.check()?;
    notifier.status("Preparing descriptors...");
    rewrite::tildify_descriptors(prefix, edits)?;

    // 2. Registry files become user-portable
    ctl.check()?;
    notifier.status("Rewriting registry files...");
    rewrite::reg_user_to_token(prefix, user, edits)?;

    // 3–5. Bottle-only rewrites
    let bundles = if opts.flavor == Flavor::Bottle {
        ctl.check()?;
        rewrite::media_user_to_token(prefix, user, edits)?;
        rebind_descriptors(prefix, opts.runners_root, edits)?
    } else {
        Bundles::default()
    };

    // 6. Stream the tar with name transforms
    ctl.check()?;
    notifier.status("Writing archive...");
    let mut sources = vec![PackSource {
        dir: prefix.to_path_buf(),
        rel: PathBuf::from(&name),
    }];
    if let Some((dir, dirname)) = &bundles.game_dir {
        sources.push(PackSource {
            dir: dir.clone(),
            rel: Path::new(&name).join("drive_c").join("GAMEDIR").join(dirname),
        });
    }
    if let Some((dir, rname)) = &bundles.runner_dir {
        sources.push(PackSource {
            dir: dir.clone(),
            rel: Path::new(&name).join("Runner").join(rname),
        });
    }

    let users_seg = format!("drive_c/users/{user}");
    let portable_seg = format!("drive_c/users/{USERNAME_TOKEN}");
    let transform = move |p: &Path| {
        let s = p.to_string_lossy();
        if s.contains(&users_seg) {
            Some(PathBuf::from(s.replace(&users_seg, &portable_seg)))
        } else {
            None
        }
    };
    pack(dest, &sources, &transform, &ctl.stop_flag())?;

    info!("archived {} to {}", prefix.display(), dest.display());
    notifier.status("Archive complete");
    Ok(())
}

/// Steps 4–5: point descriptors at the locations their bundled game
/// directory and runner will occupy after extraction. The original
/// descriptor bytes are snapshotted for revert.
fn rebind_descriptors(
    prefix: &Path,
    runners_root: &Path,
    edits: &mut TextEdits,
) -> Result<Bundles> {
    let mut bundles = Bundles::default();

    for charm in rewrite::descriptor_like_files(prefix) {
        if charm.extension().map(|e| e != "charm").unwrap_or(true) {
            continue;
        }
        let Ok(mut descriptor) = Descriptor::load(&charm) else {
            continue;
        };
        let mut dirty = false;

        // 4. Exe outside the prefix: carry its directory as GAMEDIR
        if !descriptor.exe_file.starts_with(prefix) {
            if let (Some(game_dir), Some(exe_name)) = (
                descriptor.exe_file.parent().map(|p| p.to_path_buf()),
                descriptor.exe_file.file_name().map(|n| n.to_owned()),
            ) {
                let dirname = game_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "GAME".into());
                descriptor.exe_file = prefix
                    .join("drive_c")
                    .join("GAMEDIR")
                    .join(&dirname)
                    .join(exe_name);
                bundles.game_dir.get_or_insert((game_dir, dirname));
                dirty = true;
            }
        }

        // 5. Runner under the runners root: carry it inside the bottle
        if !descriptor.runner.is_empty() {
            let runner = PathBuf::from(&descriptor.runner);
            if runner.starts_with(runners_root) {
                if let Ok(rel) = runner.strip_prefix(runners_root) {
                    if let Some(std::path::Component::Normal(rname)) = rel.components().next() {
                        let rname = rname.to_string_lossy().into_owned();
                        descriptor.runner = prefix
                            .join("Runner")
                            .join(&rname)
                            .join("bin")
                            .join("wine")
                            .to_string_lossy()
                            .into_owned();
                        bundles
                            .runner_dir
                            .get_or_insert((runners_root.join(&rname), rname));
                        dirty = true;
                    }
                }
            }
        }

        if dirty {
            edits.snapshot(&charm)?;
            descriptor.save()?;
            debug!("rebound descriptor {}", charm.display());
        }
    }
    Ok(bundles)
}
