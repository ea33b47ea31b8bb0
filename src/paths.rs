// src/paths.rs

//! Data-root resolution and home-relative path handling
//!
//! One place knows where application state lives and how `~` is
//! spelled. All persisted paths are tildified (`~/...`); all in-memory
//! paths are resolved absolutes. No other module may mention `$HOME`
//! or `~`.
//!
//! Layout under the data root:
//!
//! ```text
//! <data-root>/
//!   Settings.yaml
//!   winecharm_socket
//!   runner_cache.yaml
//!   Prefixes/<stem>-<hash10>/
//!   Templates/WineCharm-win64/
//!   Runners/<name>/bin/wine
//!   tmp/
//! ```

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Application directory name under the platform data dir
const APP_DIR: &str = "winecharm";

/// Resolved filesystem roots for one application instance
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    /// Resolve the default data root (`~/.local/share/winecharm` on
    /// Linux) and create the directory skeleton.
    pub fn resolve() -> Result<Self> {
        let base = dirs::data_dir()
            .ok_or_else(|| Error::Fatal("cannot determine user data directory".into()))?;
        Self::at(base.join(APP_DIR))
    }

    /// Use an explicit root (tests, alternate instances)
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let this = Self { root };
        for dir in [
            this.root.clone(),
            this.prefixes_dir(),
            this.templates_dir(),
            this.runners_dir(),
            this.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::Fatal(format!("cannot create {}: {}", dir.display(), e)))?;
        }
        Ok(this)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefixes_dir(&self) -> PathBuf {
        self.root.join("Prefixes")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("Templates")
    }

    pub fn runners_dir(&self) -> PathBuf {
        self.root.join("Runners")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("Settings.yaml")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.root.join("winecharm_socket")
    }

    pub fn runner_cache_file(&self) -> PathBuf {
        self.root.join("runner_cache.yaml")
    }

    /// Template directory for an architecture (`WineCharm-win64`)
    pub fn template_dir(&self, arch: &str) -> PathBuf {
        self.templates_dir().join(format!("WineCharm-{}", arch))
    }

    /// Shared prefix used in single-prefix mode, per architecture
    pub fn single_prefix_dir(&self, arch: &str) -> PathBuf {
        self.prefixes_dir().join(format!("WineCharm-Single-{}", arch))
    }
}

/// The current user's home directory
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| Error::Fatal("cannot determine home directory".into()))
}

/// The host account name, from `USER` then `USERNAME`
pub fn host_user() -> Result<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .map_err(|_| Error::Fatal("cannot determine host user name (USER/USERNAME unset)".into()))
}

/// Replace a leading home directory with `~`
///
/// Paths outside the home directory are returned unchanged.
///
/// ```
/// use winecharm::paths::{tildify, untildify};
/// let home = dirs::home_dir().unwrap();
/// let p = home.join("Games/app.exe");
/// let t = tildify(&p);
/// assert!(t.to_string_lossy().starts_with("~/"));
/// assert_eq!(untildify(&t), p);
/// ```
pub fn tildify(path: &Path) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        if let Ok(rest) = path.strip_prefix(&home) {
            if rest.as_os_str().is_empty() {
                return PathBuf::from("~");
            }
            return PathBuf::from("~").join(rest);
        }
    }
    path.to_path_buf()
}

/// Resolve a leading `~` back to the home directory
pub fn untildify(path: &Path) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        if path == Path::new("~") {
            return home;
        }
        if let Ok(rest) = path.strip_prefix("~") {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Tildify the string form, for text stored inside YAML fields
pub fn tildify_str(s: &str) -> String {
    tildify(Path::new(s)).to_string_lossy().into_owned()
}

/// Untildify the string form
pub fn untildify_str(s: &str) -> String {
    untildify(Path::new(s)).to_string_lossy().into_owned()
}
