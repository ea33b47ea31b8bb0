// src/settings.rs

//! Persistent application settings (`Settings.yaml`)
//!
//! Loaded once at start-up and rewritten whole on every mutation.
//! Paths are stored tildified and resolved on access, never the other
//! way round.

use crate::error::Result;
use crate::paths::{tildify_str, untildify_str, DataRoot};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Wine prefix architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Arch {
    #[serde(rename = "win32")]
    Win32,
    #[default]
    #[serde(rename = "win64")]
    Win64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Win32 => "win32",
            Arch::Win64 => "win64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "win32" => Some(Arch::Win32),
            "win64" => Some(Arch::Win64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Process-wide settings, serialized to `<data-root>/Settings.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default template path, tildified
    pub template: String,
    /// Default runner path, tildified; empty means system wine
    pub runner: String,
    pub arch: Arch,
    /// Present shortcuts as an icon grid rather than a list
    pub icon_view: bool,
    /// Place every new executable in one shared per-arch prefix
    #[serde(rename = "single-prefix")]
    pub single_prefix: bool,
    /// Extra environment template applied to every launch
    pub env_vars: String,
    /// WINEDEBUG channel expression
    pub wine_debug: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            template: String::new(),
            runner: String::new(),
            arch: Arch::default(),
            icon_view: false,
            single_prefix: false,
            env_vars: String::new(),
            wine_debug: "-all".to_string(),
        }
    }
}

impl Settings {
    /// Load settings, synthesizing defaults when the file is absent.
    ///
    /// A missing `template` is defaulted to the per-arch template path
    /// so first-run code has a concrete target to initialize.
    pub fn load(root: &DataRoot) -> Result<Self> {
        let file = root.settings_file();
        let mut settings = if file.is_file() {
            let text = std::fs::read_to_string(&file)?;
            serde_yaml::from_str(&text)?
        } else {
            debug!("no settings file at {}, using defaults", file.display());
            Settings::default()
        };
        if settings.template.is_empty() {
            settings.template =
                tildify_str(&root.template_dir(settings.arch.as_str()).to_string_lossy());
        }
        Ok(settings)
    }

    /// Whole-file rewrite, tildified
    pub fn save(&self, root: &DataRoot) -> Result<()> {
        let mut on_disk = self.clone();
        on_disk.template = tildify_str(&on_disk.template);
        on_disk.runner = tildify_str(&on_disk.runner);
        let text = serde_yaml::to_string(&on_disk)?;
        std::fs::write(root.settings_file(), text)?;
        Ok(())
    }

    /// Resolved template directory
    pub fn template_path(&self) -> PathBuf {
        PathBuf::from(untildify_str(&self.template))
    }

    /// Resolved runner path; `None` means "system default"
    pub fn runner_path(&self) -> Option<PathBuf> {
        if self.runner.is_empty() {
            None
        } else {
            Some(PathBuf::from(untildify_str(&self.runner)))
        }
    }
}
