// src/descriptor.rs

//! Shortcut descriptors (`.charm` files)
//!
//! A descriptor pairs one Windows executable with the prefix, runner,
//! arguments and environment needed to run it. On disk it is a YAML
//! mapping with home-relative paths; in memory every path is resolved.
//!
//! Parsing is two-phase: a permissive [`RawDescriptor`] accepts any
//! subset of fields (and ignores unknown ones), then [`Descriptor::normalize`]
//! repairs what it can and rejects what it must. Repairs are
//! non-destructive: a blank `wineprefix` defaults to the file's parent
//! directory, a blank `sha256sum` is recomputed from the executable
//! bytes, but a hash that is present is never silently replaced.

use crate::error::{Error, Result};
use crate::paths::{tildify_str, untildify_str};
use crate::pe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Descriptor file extension
pub const CHARM_EXT: &str = "charm";

/// Parser-boundary form: every field optional, unknown fields ignored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawDescriptor {
    pub exe_file: Option<String>,
    pub script_path: Option<String>,
    pub wineprefix: Option<String>,
    pub progname: Option<String>,
    pub args: Option<String>,
    pub sha256sum: Option<String>,
    pub env_vars: Option<String>,
    pub runner: Option<String>,
    pub wine_debug: Option<String>,
}

/// A normalized, in-memory descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Full SHA-256 of the executable bytes; the catalog key
    pub sha256sum: String,
    /// Resolved path of the PE target
    pub exe_file: PathBuf,
    /// Resolved path of the descriptor file itself
    pub script_path: PathBuf,
    /// Resolved path of the owning prefix directory
    pub wineprefix: PathBuf,
    pub progname: String,
    pub args: String,
    /// Semicolon-separated `K=V` list
    pub env_vars: String,
    /// Runner binary path; empty means system default
    pub runner: String,
    pub wine_debug: String,
    /// Descriptor-file modification time; populated at load, never
    /// persisted
    pub mtime: Option<DateTime<Utc>>,
}

impl Descriptor {
    /// Load and normalize one descriptor file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::not_found(path));
        }
        let text = std::fs::read_to_string(path)?;
        let raw: RawDescriptor = serde_yaml::from_str(&text)
            .map_err(|e| Error::invalid("descriptor", format!("{}: {}", path.display(), e)))?;
        Self::normalize(raw, path)
    }

    /// Repair missing fields and resolve paths
    pub fn normalize(raw: RawDescriptor, path: &Path) -> Result<Self> {
        let exe_file = raw
            .exe_file
            .as_deref()
            .map(untildify_str)
            .map(PathBuf::from)
            .ok_or_else(|| Error::invalid("descriptor", format!("{}: no exe_file", path.display())))?;

        let wineprefix = match raw.wineprefix.as_deref() {
            Some(p) if !p.is_empty() => PathBuf::from(untildify_str(p)),
            _ => path
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| Error::invalid("descriptor", "no parent directory"))?,
        };

        let sha256sum = match raw.sha256sum {
            Some(h) if !h.is_empty() => {
                if h.len() != 64 || !h.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(Error::invalid(
                        "descriptor",
                        format!("{}: malformed sha256sum", path.display()),
                    ));
                }
                h.to_lowercase()
            }
            _ => {
                debug!("recomputing hash for {}", exe_file.display());
                pe::sha256_file(&exe_file)?
            }
        };

        let progname = raw
            .progname
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| default_progname(&exe_file));

        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Ok(Self {
            sha256sum,
            exe_file,
            script_path: path.to_path_buf(),
            wineprefix,
            progname,
            args: raw.args.unwrap_or_default(),
            env_vars: raw.env_vars.unwrap_or_default(),
            runner: raw.runner.map(|r| untildify_str(&r)).unwrap_or_default(),
            wine_debug: raw.wine_debug.unwrap_or_default(),
            mtime,
        })
    }

    /// Write the descriptor to `script_path`, tildified
    pub fn save(&self) -> Result<()> {
        let raw = RawDescriptor {
            exe_file: Some(tildify_str(&self.exe_file.to_string_lossy())),
            script_path: Some(tildify_str(&self.script_path.to_string_lossy())),
            wineprefix: Some(tildify_str(&self.wineprefix.to_string_lossy())),
            progname: Some(self.progname.clone()),
            args: Some(self.args.clone()),
            sha256sum: Some(self.sha256sum.clone()),
            env_vars: Some(self.env_vars.clone()),
            runner: Some(if self.runner.is_empty() {
                String::new()
            } else {
                tildify_str(&self.runner)
            }),
            wine_debug: Some(self.wine_debug.clone()),
        };
        let text = serde_yaml::to_string(&raw)?;
        std::fs::write(&self.script_path, text)?;
        Ok(())
    }

    /// Filesystem stem of the descriptor file (`Setup` for `Setup.charm`)
    pub fn stem(&self) -> String {
        self.script_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Sibling icon path (`<stem>.png`)
    pub fn icon_path(&self) -> PathBuf {
        self.script_path.with_extension("png")
    }

    /// Sibling stderr log path (`<exe-stem>.log` inside the prefix)
    pub fn log_path(&self) -> PathBuf {
        let stem = self
            .exe_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wine".into());
        self.wineprefix.join(format!("{}.log", stem))
    }

    /// Parse `env_vars` into key/value pairs, rejecting malformed
    /// tokens rather than passing them to the shell.
    pub fn parsed_env_vars(&self) -> Result<Vec<(String, String)>> {
        parse_env_vars(&self.env_vars)
    }
}

/// Fallback program name: executable stem with spaces replaced
pub fn default_progname(exe: &Path) -> String {
    exe.file_stem()
        .map(|s| s.to_string_lossy().replace(' ', "_"))
        .unwrap_or_else(|| "unknown".into())
}

/// Parse a semicolon-separated `K=V` list
///
/// Keys must match `[A-Za-z_][A-Za-z0-9_]*`; empty tokens between
/// semicolons are tolerated.
pub fn parse_env_vars(list: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for token in list.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| Error::invalid("env_vars", format!("token without '=': {token}")))?;
        if !is_valid_env_key(key) {
            return Err(Error::invalid("env_vars", format!("bad variable name: {key}")));
        }
        out.push((key.to_string(), value.to_string()));
    }
    Ok(out)
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
