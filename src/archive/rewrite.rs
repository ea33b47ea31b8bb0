// src/archive/rewrite.rs

//! In-place text edits for portability
//!
//! Two kinds of files are rewritten rather than name-transformed:
//! registry files (`*.reg`), whose *contents* mention the host user,
//! and descriptor-like YAML files, whose contents mention `$HOME`.
//! During archive creation every edit is recorded so the live prefix
//! can be reverted byte-for-byte once the tar stream is written.

use crate::error::Result;
use crate::paths::home_dir;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Portable stand-in for the host account name inside archives
pub const USERNAME_TOKEN: &str = "%USERNAME%";

/// Reverse-substitution sentinels found in legacy (`.wzt`) backups.
/// The tokens are carried verbatim from the third-party format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// `XOUSERXO` — the archiving user's account name
    User,
    /// `XOPREFIXXO` — the absolute prefix path
    PrefixPath,
    /// `XOCONFIGXO` — the application data root
    ConfigPath,
    /// `XOINSTALLERXO` — the original installer path
    InstallerPath,
}

pub const WZT_SENTINELS: &[(&str, Sentinel)] = &[
    ("XOUSERXO", Sentinel::User),
    ("XOPREFIXXO", Sentinel::PrefixPath),
    ("XOCONFIGXO", Sentinel::ConfigPath),
    ("XOINSTALLERXO", Sentinel::InstallerPath),
];

/// Record of reversible in-place edits
#[derive(Debug, Default)]
pub struct TextEdits {
    originals: Vec<(PathBuf, String)>,
}

impl TextEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `replace` to a UTF-8 text file, remembering the original
    /// when anything changed. Binary or unreadable files are skipped.
    pub fn apply(&mut self, path: &Path, from: &str, to: &str) -> Result<()> {
        let Ok(text) = fs::read_to_string(path) else {
            debug!("skipping non-text file {}", path.display());
            return Ok(());
        };
        if !text.contains(from) {
            return Ok(());
        }
        let rewritten = text.replace(from, to);
        fs::write(path, &rewritten)?;
        self.originals.push((path.to_path_buf(), text));
        Ok(())
    }

    /// Record a file's current content without editing it, so a later
    /// structured rewrite (descriptor re-save) can still be reverted.
    pub fn snapshot(&mut self, path: &Path) -> Result<()> {
        if self.originals.iter().any(|(p, _)| p == path) {
            return Ok(());
        }
        let text = fs::read_to_string(path)?;
        self.originals.push((path.to_path_buf(), text));
        Ok(())
    }

    /// Restore every edited file to its recorded content. Errors are
    /// logged, not propagated: revert runs on both success and error
    /// paths and must do as much as it can.
    pub fn revert(self) {
        for (path, original) in self.originals.into_iter().rev() {
            if let Err(e) = fs::write(&path, original) {
                warn!("cannot revert edit of {}: {}", path.display(), e);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }
}

/// Registry files at the prefix root (`system.reg`, `user.reg`, ...)
pub fn reg_files(prefix: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(prefix) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "reg").unwrap_or(false) && path.is_file() {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

/// Descriptor-like text files under the prefix whose contents may
/// carry absolute home paths (the descriptors themselves and their
/// `.bak` siblings).
pub fn descriptor_like_files(prefix: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(prefix)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|x| x == "charm" || x == "bak" || x == "yaml")
                .unwrap_or(false)
        })
        .collect();
    out.sort();
    out
}

/// Replace the host user with [`USERNAME_TOKEN`] in every reg file,
/// recording the edits for revert.
pub fn reg_user_to_token(prefix: &Path, host_user: &str, edits: &mut TextEdits) -> Result<()> {
    let from = format!("users/{host_user}");
    let to = format!("users/{USERNAME_TOKEN}");
    for reg in reg_files(prefix) {
        edits.apply(&reg, &from, &to)?;
    }
    Ok(())
}

/// Bottle-only: `/media/<user>` mount paths in reg files become
/// portable too.
pub fn media_user_to_token(prefix: &Path, host_user: &str, edits: &mut TextEdits) -> Result<()> {
    let from = format!("/media/{host_user}");
    let to = format!("/media/{USERNAME_TOKEN}");
    for reg in reg_files(prefix) {
        edits.apply(&reg, &from, &to)?;
    }
    Ok(())
}

/// Replace [`USERNAME_TOKEN`] with the host user after extraction.
/// One-way; nothing is recorded.
pub fn reg_token_to_user(prefix: &Path, host_user: &str) -> Result<()> {
    for reg in reg_files(prefix) {
        let mut throwaway = TextEdits::new();
        throwaway.apply(&reg, USERNAME_TOKEN, host_user)?;
    }
    Ok(())
}

/// Tildify absolute `$HOME` paths inside descriptor-like files,
/// recording edits for revert.
pub fn tildify_descriptors(prefix: &Path, edits: &mut TextEdits) -> Result<()> {
    let home = home_dir()?.to_string_lossy().into_owned();
    for file in descriptor_like_files(prefix) {
        edits.apply(&file, &home, "~")?;
    }
    Ok(())
}

/// Replace every known `.wzt` sentinel in the extracted prefix's text
/// files with its host-side value.
pub fn replace_wzt_sentinels(
    prefix: &Path,
    values: &HashMap<Sentinel, String>,
) -> Result<()> {
    let mut files = reg_files(prefix);
    files.extend(descriptor_like_files(prefix));
    for file in files {
        for (token, kind) in WZT_SENTINELS {
            if let Some(value) = values.get(kind) {
                let mut throwaway = TextEdits::new();
                throwaway.apply(&file, token, value)?;
            }
        }
    }
    Ok(())
}
