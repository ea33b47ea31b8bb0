// src/template.rs

//! Base-prefix template engine
//!
//! A template is a pristine prefix seeded by `wineboot` once per
//! architecture and cloned for every new executable. Creation follows
//! an atomic-replace pattern: all work happens in a `.temp_<name>`
//! sibling, the final rename is the only visible mutation, and any
//! failure or cancellation deletes the temp and leaves a pre-existing
//! template untouched.
//!
//! Component installation (winetricks verbs) extends the pattern with
//! a backup sibling: the live template is copied aside first and
//! swapped back wholesale when anything goes wrong.

use crate::error::{Error, Result};
use crate::exec;
use crate::fsutil;
use crate::notify::Notifier;
use crate::paths::host_user;
use crate::settings::Arch;
use crate::task::TaskControl;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// winetricks' own log name; doubles as the record of installed verbs
const COMPONENT_LOG: &str = "winetricks.log";

pub struct TemplateEngine {
    /// Wine binary to seed with; `None` resolves the system wine
    runner: Option<PathBuf>,
}

impl TemplateEngine {
    pub fn new(runner: Option<PathBuf>) -> Self {
        Self { runner }
    }

    /// Create (or replace) the template at `target` for `arch`.
    pub fn initialize(
        &self,
        target: &Path,
        arch: Arch,
        ctl: &TaskControl,
        notifier: &dyn Notifier,
    ) -> Result<()> {
        let temp = temp_sibling(target);
        fsutil::remove_tree_if_exists(&temp)?;
        fs::create_dir_all(&temp)?;
        info!("initializing {} template in {}", arch, temp.display());
        notifier.status(&format!("Initializing {arch} template..."));

        let result = self.boot_prefix(&temp, arch, ctl);
        let result = result.and_then(|()| {
            ctl.check()?;
            let user_dir = temp.join("drive_c").join("users").join(host_user()?);
            fsutil::realize_user_shell_dirs(&user_dir)
        });

        match result {
            Ok(()) => {
                // The swap is the only moment the target is touched
                fsutil::remove_tree_if_exists(target)?;
                fs::rename(&temp, target)?;
                notifier.status("Template ready");
                Ok(())
            }
            Err(e) => {
                let _ = fsutil::remove_tree_if_exists(&temp);
                Err(e)
            }
        }
    }

    /// Install winetricks verbs into a live template. The current
    /// template is copied to a backup sibling first; on any failure or
    /// cancel the backup is swapped back in.
    pub fn install_components(
        &self,
        template: &Path,
        verbs: &[String],
        ctl: &TaskControl,
        notifier: &dyn Notifier,
    ) -> Result<()> {
        if !template.is_dir() {
            return Err(Error::not_found(template));
        }
        if verbs.is_empty() {
            return Ok(());
        }

        let backup = fsutil::backup_sibling(template);
        fsutil::copy_tree(template, &backup, &ctl.stop_flag())?;
        debug!("template backed up to {}", backup.display());

        let result = (|| -> Result<()> {
            for verb in verbs {
                ctl.check()?;
                notifier.status(&format!("Installing {verb}..."));
                let mut cmd = Command::new("winetricks");
                cmd.arg("-q")
                    .arg(verb)
                    .env("WINEPREFIX", template)
                    .env("WINEDEBUG", "-all");
                if let Some(runner) = &self.runner {
                    if let Some(bin) = runner.parent() {
                        cmd.env("PATH", prepend_path(bin));
                    }
                    cmd.env("WINE", runner);
                }
                exec::run_step(&mut cmd, ctl, "winetricks")?;
                record_component(template, verb)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                fsutil::remove_tree_if_exists(&backup)?;
                notifier.status("Components installed");
                Ok(())
            }
            Err(e) => {
                // Swap the backup back in wholesale
                let _ = fsutil::remove_tree_if_exists(template);
                let _ = fs::rename(&backup, template);
                Err(e)
            }
        }
    }

    /// Verbs recorded in the template's component log
    pub fn installed_components(template: &Path) -> Result<Vec<String>> {
        let log = template.join(COMPONENT_LOG);
        if !log.is_file() {
            return Ok(Vec::new());
        }
        Ok(fs::read_to_string(log)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Resolve the wine binary used for seeding
    fn wine_binary(&self) -> Result<PathBuf> {
        match &self.runner {
            Some(runner) => {
                if runner.is_file() {
                    Ok(runner.clone())
                } else {
                    Err(Error::InvalidRunner(runner.clone()))
                }
            }
            None => which::which("wine").map_err(|_| Error::InvalidRunner("wine".into())),
        }
    }

    fn boot_prefix(&self, prefix: &Path, arch: Arch, ctl: &TaskControl) -> Result<()> {
        let wine = self.wine_binary()?;
        let mut cmd = Command::new(&wine);
        cmd.args(["wineboot", "-i"])
            .env("WINEARCH", arch.as_str())
            .env("WINEPREFIX", prefix)
            .env("WINEDEBUG", "-all");
        if let Some(bin) = wine.parent() {
            cmd.env("PATH", prepend_path(bin));
        }
        exec::run_step(&mut cmd, ctl, "wineboot")
    }
}

/// `.temp_<name>` sibling next to the final target
fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "template".into());
    target.with_file_name(format!(".temp_{name}"))
}

/// Append one verb to the component log
fn record_component(template: &Path, verb: &str) -> Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(template.join(COMPONENT_LOG))?;
    writeln!(file, "{verb}")?;
    Ok(())
}

/// `<bin>:<existing PATH>`
pub fn prepend_path(bin: &Path) -> String {
    match std::env::var("PATH") {
        Ok(path) => format!("{}:{}", bin.display(), path),
        Err(_) => bin.display().to_string(),
    }
}
