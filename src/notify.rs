// src/notify.rs

//! UI callback seam
//!
//! The desktop front-end is an external collaborator; everything it
//! needs to observe flows through the [`Notifier`] trait. The core
//! never talks to a widget: workers call these methods (or post them
//! via the event queue) and the front-end decides presentation.
//!
//! Implementations:
//! - [`LogNotifier`]: routes everything to tracing (CLI default)
//! - [`SilentNotifier`]: no-op for tests and scripted use

use std::path::PathBuf;
use tracing::{error, info};

/// Lifecycle states of a launched descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Ending,
    Respawned,
}

/// Callbacks from the core to the front-end
///
/// Implementations must be thread-safe: supervision and pipeline
/// workers invoke them directly.
pub trait Notifier: Send + Sync {
    /// Transient status line ("Extracting icon...", "Step 3/7")
    fn status(&self, message: &str);

    /// Modal information dialog
    fn info_dialog(&self, title: &str, body: &str);

    /// Error surfacing; `log` points at the stderr capture when one
    /// exists (non-zero wine exit)
    fn error_dialog(&self, title: &str, body: &str, log: Option<PathBuf>);

    /// A descriptor changed supervision state
    fn process_state(&self, sha256sum: &str, state: ProcessState);
}

/// Routes notifications to the tracing subscriber
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn status(&self, message: &str) {
        info!("{}", message);
    }

    fn info_dialog(&self, title: &str, body: &str) {
        info!("{}: {}", title, body);
    }

    fn error_dialog(&self, title: &str, body: &str, log: Option<PathBuf>) {
        match log {
            Some(log) => error!("{}: {} (log: {})", title, body, log.display()),
            None => error!("{}: {}", title, body),
        }
    }

    fn process_state(&self, sha256sum: &str, state: ProcessState) {
        info!("process {}: {:?}", &sha256sum[..sha256sum.len().min(10)], state);
    }
}

/// Swallows everything
#[derive(Debug, Default)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn status(&self, _message: &str) {}
    fn info_dialog(&self, _title: &str, _body: &str) {}
    fn error_dialog(&self, _title: &str, _body: &str, _log: Option<PathBuf>) {}
    fn process_state(&self, _sha256sum: &str, _state: ProcessState) {}
}
