// src/prefix.rs

//! Prefix builder: executable in, prefix + descriptor + icon out
//!
//! The builder names prefix directories after the executable stem and
//! the first 10 hex chars of its digest (`setup-abc0000000`), while
//! the descriptor file is named after the display name
//! (`Setup.charm`). The full digest is only ever the catalog key.
//!
//! Also owns the per-prefix `found_lnk_files.yaml` bookkeeping that
//! keeps installer-created Windows shortcuts from spawning duplicate
//! descriptors on re-scan.

use crate::catalog::Catalog;
use crate::descriptor::{Descriptor, CHARM_EXT};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::notify::Notifier;
use crate::paths::DataRoot;
use crate::pe;
use crate::settings::Settings;
use crate::task::TaskControl;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Per-prefix record of consumed `.lnk` basenames
const FOUND_LNK_FILE: &str = "found_lnk_files.yaml";

pub struct PrefixBuilder<'a> {
    root: &'a DataRoot,
    settings: &'a Settings,
}

impl<'a> PrefixBuilder<'a> {
    pub fn new(root: &'a DataRoot, settings: &'a Settings) -> Self {
        Self { root, settings }
    }

    /// Bind `exe` to a prefix, write its descriptor and icon, and
    /// insert it at the head of the catalog. Returns the catalog key.
    pub fn create(
        &self,
        exe: &Path,
        catalog: &mut Catalog,
        ctl: &TaskControl,
        notifier: &dyn Notifier,
    ) -> Result<String> {
        notifier.status(&format!("Inspecting {}...", exe.display()));
        let inspection = pe::inspect(exe)?;
        let prefix = self.choose_prefix(exe, &inspection.sha256sum, ctl)?;
        self.create_in_prefix(exe, &prefix, inspection, catalog, notifier)
    }

    /// Regenerate a descriptor from its current executable and prefix:
    /// the old file is kept as `<name>.bak`.
    pub fn reset(
        &self,
        key: &str,
        catalog: &mut Catalog,
        notifier: &dyn Notifier,
    ) -> Result<String> {
        let old = catalog.take_to_bak(key)?;
        let inspection = pe::inspect(&old.exe_file)?;
        // The prefix stays what it was; only the descriptor is rebuilt
        if !old.wineprefix.is_dir() {
            return Err(Error::not_found(&old.wineprefix));
        }
        self.create_in_prefix(&old.exe_file, &old.wineprefix, inspection, catalog, notifier)
    }

    /// Descriptor + icon inside an already-chosen prefix
    pub fn create_in_prefix(
        &self,
        exe: &Path,
        prefix: &Path,
        inspection: pe::Inspection,
        catalog: &mut Catalog,
        notifier: &dyn Notifier,
    ) -> Result<String> {
        let stem = pe::safe_stem(&inspection.progname);
        let script_path = prefix.join(format!("{stem}.{CHARM_EXT}"));

        let descriptor = Descriptor {
            sha256sum: inspection.sha256sum.clone(),
            exe_file: exe.to_path_buf(),
            script_path,
            wineprefix: prefix.to_path_buf(),
            progname: inspection.progname.clone(),
            args: String::new(),
            env_vars: self.settings.env_vars.clone(),
            runner: self.settings.runner.clone(),
            wine_debug: self.settings.wine_debug.clone(),
            mtime: None,
        };
        descriptor.save()?;

        if let Some(png) = &inspection.icon_png {
            if let Err(e) = fs::write(descriptor.icon_path(), png) {
                warn!("cannot write icon for {}: {}", descriptor.progname, e);
            }
        }

        info!(
            "created shortcut {} in {}",
            descriptor.progname,
            prefix.display()
        );
        notifier.status(&format!("Created {}", descriptor.progname));

        let key = descriptor.sha256sum.clone();
        catalog.put_front(descriptor);
        Ok(key)
    }

    /// Pick (and if needed create) the prefix directory for `exe`
    fn choose_prefix(&self, exe: &Path, sha256sum: &str, ctl: &TaskControl) -> Result<PathBuf> {
        let prefix = if self.settings.single_prefix {
            self.root.single_prefix_dir(self.settings.arch.as_str())
        } else {
            let exe_stem = pe::safe_stem(&crate::descriptor::default_progname(exe));
            self.root
                .prefixes_dir()
                .join(format!("{}-{}", exe_stem, pe::short_hash(sha256sum)))
        };
        if !prefix.is_dir() {
            self.clone_template(&prefix, ctl)?;
        }
        Ok(prefix)
    }

    /// Clone the configured template into a new prefix directory
    fn clone_template(&self, prefix: &Path, ctl: &TaskControl) -> Result<()> {
        let template = self.settings.template_path();
        if !template.is_dir() {
            return Err(Error::not_found(&template));
        }
        debug!("cloning {} -> {}", template.display(), prefix.display());
        match fsutil::copy_tree(&template, prefix, &ctl.stop_flag()) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fsutil::remove_tree_if_exists(prefix);
                Err(e)
            }
        }
    }

    /// Scan a prefix for installer-created `.lnk` shortcuts that have
    /// not been consumed yet, synthesize descriptors for targets that
    /// resolve to executables inside the prefix, and record the names.
    /// Returns the keys of newly created descriptors.
    pub fn consume_lnk_files(
        &self,
        prefix: &Path,
        catalog: &mut Catalog,
        notifier: &dyn Notifier,
    ) -> Result<Vec<String>> {
        let mut consumed = load_found_lnk(prefix)?;
        let mut created = Vec::new();

        let lnk_files: Vec<PathBuf> = WalkDir::new(prefix)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().map(|x| x == "lnk").unwrap_or(false))
            .collect();

        for lnk in lnk_files {
            let name = lnk
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if consumed.contains(&name) {
                continue;
            }
            consumed.push(name.clone());

            let Some(target) = lnk_target(prefix, &lnk)? else {
                debug!("no resolvable target in {}", lnk.display());
                continue;
            };
            if !target.is_file() || catalog.iter().any(|d| d.exe_file == target) {
                continue;
            }
            match pe::inspect(&target) {
                Ok(inspection) => {
                    let key =
                        self.create_in_prefix(&target, prefix, inspection, catalog, notifier)?;
                    created.push(key);
                }
                Err(e) => warn!("cannot inspect lnk target {}: {}", target.display(), e),
            }
        }

        save_found_lnk(prefix, &consumed)?;
        Ok(created)
    }
}

/// Remove a prefix directory and drop every catalog entry inside it
pub fn delete_prefix(prefix: &Path, catalog: &mut Catalog) -> Result<()> {
    let keys: Vec<String> = catalog
        .in_prefix(prefix)
        .iter()
        .map(|d| d.sha256sum.clone())
        .collect();
    for key in keys {
        catalog.remove(&key);
    }
    fsutil::remove_tree_if_exists(prefix)?;
    info!("deleted prefix {}", prefix.display());
    Ok(())
}

/// Rename a prefix directory and rewrite `wineprefix`/`script_path`
/// in every descriptor it contains. Keys are unchanged.
pub fn rename_prefix(prefix: &Path, new_name: &str, catalog: &mut Catalog) -> Result<PathBuf> {
    let new_dir = prefix.with_file_name(pe::safe_stem(new_name));
    if new_dir.exists() {
        return Err(Error::Conflict { path: new_dir });
    }
    fs::rename(prefix, &new_dir)?;

    let keys: Vec<String> = catalog
        .in_prefix(prefix)
        .iter()
        .map(|d| d.sha256sum.clone())
        .collect();
    for key in keys {
        if let Some(old) = catalog.get(&key).cloned() {
            let mut updated = old;
            updated.wineprefix = new_dir.clone();
            let file_name = updated
                .script_path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            updated.script_path = new_dir.join(file_name);
            updated.save()?;
            catalog.put(updated);
        }
    }
    Ok(new_dir)
}

/// Consumed `.lnk` basenames for a prefix
pub fn load_found_lnk(prefix: &Path) -> Result<Vec<String>> {
    let file = prefix.join(FOUND_LNK_FILE);
    if !file.is_file() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(file)?;
    Ok(serde_yaml::from_str(&text)?)
}

fn save_found_lnk(prefix: &Path, names: &[String]) -> Result<()> {
    let text = serde_yaml::to_string(names)?;
    fs::write(prefix.join(FOUND_LNK_FILE), text)?;
    Ok(())
}

/// Best-effort target resolution for a Windows `.lnk` file.
///
/// Shell links carry the target as an ASCII `C:\...` local base path;
/// rather than replaying the whole ShellLink format we scan for that
/// string and map the drive onto the prefix's `drive_c`. Returns
/// `Ok(None)` for links without a recognizable local target.
pub fn lnk_target(prefix: &Path, lnk: &Path) -> Result<Option<PathBuf>> {
    let bytes = fs::read(lnk)?;
    // ShellLinkHeader starts with its own size, 0x4C
    if bytes.len() < 4 || bytes[0..4] != [0x4C, 0, 0, 0] {
        return Ok(None);
    }

    let mut best: Option<String> = None;
    let mut current = String::new();
    for &b in &bytes {
        if (0x20..0x7f).contains(&b) {
            current.push(b as char);
        } else {
            consider_lnk_candidate(&mut best, &current);
            current.clear();
        }
    }
    consider_lnk_candidate(&mut best, &current);

    Ok(best.map(|windows_path| {
        let rest = windows_path[3..].replace('\\', "/");
        prefix.join("drive_c").join(rest)
    }))
}

/// Keep the longest `C:\...exe` string seen so far
fn consider_lnk_candidate(best: &mut Option<String>, candidate: &str) {
    let lower = candidate.to_lowercase();
    if lower.starts_with("c:\\")
        && lower.ends_with(".exe")
        && best.as_ref().map(|b| candidate.len() > b.len()).unwrap_or(true)
    {
        *best = Some(candidate.to_string());
    }
}
