// src/lib.rs

//! WineCharm
//!
//! Wine prefix lifecycle manager: bind Windows executables to isolated
//! prefixes and run them through a managed Wine runner.
//!
//! # Architecture
//!
//! - Content-addressed: shortcuts are keyed by the executable's SHA-256
//! - Descriptors: one `.charm` YAML file per shortcut, living inside
//!   its prefix so archives stay self-describing
//! - Templates: pristine per-arch prefixes cloned for every new binding
//! - Supervision: launches are tagged with a unique environment id and
//!   tracked across Wine's re-exec and respawn behavior
//! - Portability: `.prefix`/`.bottle` archives rewrite user-specific
//!   paths to tokens on the way out and back on the way in

pub mod archive;
pub mod catalog;
pub mod cli;
pub mod control;
pub mod descriptor;
mod error;
pub mod exec;
pub mod fsutil;
pub mod launch;
pub mod notify;
pub mod paths;
pub mod pe;
pub mod prefix;
pub mod runner;
pub mod settings;
pub mod task;
pub mod template;

pub use catalog::{Catalog, SortField};
pub use descriptor::Descriptor;
pub use error::{Error, Result};
pub use launch::Supervisor;
pub use notify::{LogNotifier, Notifier, ProcessState, SilentNotifier};
pub use paths::DataRoot;
pub use settings::{Arch, Settings};
pub use task::{EventPoster, EventQueue, StopFlag, TaskControl};
