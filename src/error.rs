// src/error.rs

//! Crate-wide error taxonomy
//!
//! Every recoverable failure in the library maps onto one of these
//! variants so callers (CLI, UI seam) can decide presentation policy
//! uniformly:
//!
//! - `NotFound` / `Invalid` / `InsufficientSpace` / `External` /
//!   `Conflict` surface to the user with context and never crash.
//! - `Cancelled` is silent; the originating pipeline has already
//!   rolled back.
//! - `Fatal` aborts start-up (data root unusable, socket bind failed).

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A file or directory the operation depends on does not exist
    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    /// Malformed input that must not be auto-repaired destructively
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    /// A runner path that is missing, not executable, or fails
    /// `--version` within the validation timeout
    #[error("not a usable wine runner: {0}")]
    InvalidRunner(PathBuf),

    /// User cancelled a pipeline; rollback has already happened
    #[error("operation cancelled")]
    Cancelled,

    /// Restore pre-check failed
    #[error("insufficient space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    /// A subprocess (wine, wineboot, component installer) failed
    #[error("{step} failed with {status}: {stderr}")]
    External {
        step: &'static str,
        status: String,
        stderr: String,
    },

    /// Import/restore target already exists and the caller has not
    /// opted into the backup-and-overwrite path
    #[error("target already exists: {path}")]
    Conflict { path: PathBuf },

    /// Start-up cannot proceed (data root, rendezvous socket)
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// True when the failure should be suppressed from user-facing
    /// dialogs (cancellation is silent by contract).
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Helper for the pervasive "path must exist" check
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Error::NotFound { path: path.into() }
    }

    pub fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Error::Invalid {
            what,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_silent() {
        assert!(Error::Cancelled.is_silent());
        assert!(!Error::not_found("/tmp/x").is_silent());
    }

    #[test]
    fn display_includes_context() {
        let e = Error::InsufficientSpace {
            required: 100,
            available: 10,
        };
        let msg = e.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("10"));

        let e = Error::External {
            step: "wineboot",
            status: "exit code 1".into(),
            stderr: "wine: cannot find".into(),
        };
        assert!(e.to_string().contains("wineboot"));
    }
}
