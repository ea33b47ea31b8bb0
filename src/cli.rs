// src/cli.rs
//! Command-line interface definitions
//!
//! The primary invocation is a single positional path (`.exe`/`.msi`
//! to bind and run, `.charm` to run headless); maintenance operations
//! live under subcommands. Implementations are in `main`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "winecharm")]
#[command(version)]
#[command(about = "Run Windows executables in isolated Wine prefixes", long_about = None)]
pub struct Cli {
    /// File to open: .exe/.msi binds it to a prefix and runs it,
    /// .charm runs the shortcut headless
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List catalogued shortcuts
    List {
        /// Sort by name, prefix, or time
        #[arg(long, default_value = "name")]
        sort: String,

        /// Reverse the sort order
        #[arg(long)]
        desc: bool,
    },

    /// Initialize (or re-initialize) the base prefix template
    InitTemplate {
        /// Architecture: win32 or win64
        #[arg(long, default_value = "win64")]
        arch: String,
    },

    /// Install winetricks components into the template
    InstallComponents {
        /// Verbs to install (e.g. corefonts vcrun2019)
        verbs: Vec<String>,
    },

    /// Archive a prefix to a portable file
    Backup {
        /// Prefix directory to archive
        prefix: PathBuf,

        /// Output file; extension selects the flavor
        /// (.prefix or .bottle)
        output: PathBuf,
    },

    /// Restore a .prefix/.bottle/.wzt archive
    Restore {
        /// Archive file to restore
        archive: PathBuf,
    },

    /// Import an existing Wine directory as a prefix
    Import {
        /// Wine directory (must contain drive_c)
        directory: PathBuf,
    },

    /// Rename a shortcut, or its whole prefix directory with --prefix
    Rename {
        /// Catalog key (full SHA-256) or unambiguous key prefix
        key: String,

        /// New display name (or directory name with --prefix)
        name: String,

        /// Rename the prefix directory and rebind its shortcuts
        #[arg(long)]
        prefix: bool,
    },

    /// Delete a shortcut, or a whole prefix with --prefix
    Delete {
        /// Catalog key (full SHA-256) or unambiguous key prefix
        key: String,

        /// Delete the whole prefix directory, not just the shortcut
        #[arg(long)]
        prefix: bool,
    },

    /// Manage Wine runners
    Runner {
        #[command(subcommand)]
        command: RunnerCommands,
    },
}

#[derive(Subcommand)]
pub enum RunnerCommands {
    /// List installed runners
    List,

    /// List downloadable runners
    Available,

    /// Download and install a runner by name
    Download {
        /// Name from `runner available`
        name: String,
    },

    /// Archive an installed runner to .tar.zst
    Backup {
        /// Installed runner name
        name: String,

        /// Output file
        output: PathBuf,
    },

    /// Restore a runner from a .tar.zst backup
    Restore {
        /// Backup archive
        archive: PathBuf,
    },
}
