// src/launch/mod.rs

//! Launching descriptors and supervising what Wine makes of them
//!
//! A launch plants [`UNIQUE_ID_VAR`] in the child environment before
//! anything Wine-side runs. Wine's loader re-execs and forks, so the
//! direct child is only the first PID of a family; the id is the
//! durable handle the supervisor and the terminator use to find the
//! rest (see [`procscan`]).

pub mod procscan;
pub mod supervisor;

pub use supervisor::Supervisor;

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::exec;
use crate::runner::RunnerRegistry;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info};

/// Environment variable carrying the per-launch identity
pub const UNIQUE_ID_VAR: &str = "WINECHARM_UNIQUE_ID";

/// Exit code a Wine child uses for "the user closed the installer";
/// suppressed from error surfacing.
pub const EXIT_USER_CANCEL: i32 = 2;

/// A successfully spawned descriptor
pub struct Launched {
    /// Catalog key (`sha256sum`)
    pub key: String,
    pub unique_id: String,
    /// Executable basename, for respawn matching
    pub exe_name: String,
    /// Basename of the executable's directory, for respawn matching
    pub exe_parent: String,
    pub wineprefix: PathBuf,
    pub runner: PathBuf,
    /// stderr capture
    pub log: PathBuf,
    pub child: Child,
}

/// Launch the descriptor at `charm`.
///
/// The descriptor is reloaded from disk so edits made since the
/// catalog scan are honored, the runner is validated, and the child is
/// spawned in its own process group with stdout discarded and stderr
/// appended to the prefix log.
pub fn launch(charm: &Path) -> Result<Launched> {
    let descriptor = Descriptor::load(charm)?;
    let runner = resolve_runner(&descriptor)?;
    if !descriptor.exe_file.is_file() {
        return Err(Error::not_found(&descriptor.exe_file));
    }

    let unique_id = new_unique_id();
    let mut cmd = build_command(&descriptor, &runner, &unique_id)?;

    let log = descriptor.log_path();
    let log_file = OpenOptions::new().create(true).append(true).open(&log)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(log_file);

    let child = exec::spawn_in_group(&mut cmd)?;
    info!(
        "launched {} (pid {}, id {})",
        descriptor.progname,
        child.id(),
        unique_id
    );

    let exe_name = file_name_of(&descriptor.exe_file);
    let exe_parent = descriptor
        .exe_file
        .parent()
        .map(file_name_of)
        .unwrap_or_default();
    Ok(Launched {
        key: descriptor.sha256sum,
        unique_id,
        exe_name,
        exe_parent,
        wineprefix: descriptor.wineprefix,
        runner,
        log,
        child,
    })
}

/// The launch command without spawning it: `sh -c` that changes into
/// the executable's directory and execs the runner on the basename.
/// Shared by the supervisor path and the headless CLI path.
pub fn build_command(
    descriptor: &Descriptor,
    runner: &Path,
    unique_id: &str,
) -> Result<Command> {
    let exe_dir = descriptor
        .exe_file
        .parent()
        .ok_or_else(|| Error::invalid("launch", "executable has no parent directory"))?;
    let exe_name = file_name_of(&descriptor.exe_file);

    let mut line = format!(
        "cd {} && exec {} {}",
        sh_quote(&exe_dir.to_string_lossy()),
        sh_quote(&runner.to_string_lossy()),
        sh_quote(&exe_name),
    );
    if !descriptor.args.trim().is_empty() {
        line.push(' ');
        line.push_str(descriptor.args.trim());
    }
    debug!("launch command: {}", line);

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd.env(UNIQUE_ID_VAR, unique_id);
    cmd.env("WINEPREFIX", &descriptor.wineprefix);
    // The runner's siblings (wineserver, preloaders) must be findable
    // by name from the whole family.
    if let Some(bin) = runner.parent() {
        cmd.env("PATH", crate::template::prepend_path(bin));
    }
    if !descriptor.wine_debug.is_empty() {
        cmd.env("WINEDEBUG", &descriptor.wine_debug);
    }
    for (key, value) in descriptor.parsed_env_vars()? {
        cmd.env(key, value);
    }
    Ok(cmd)
}

/// Resolve and validate the descriptor's runner, falling back to the
/// system wine when none is set. Any validation failure is
/// `InvalidRunner`.
pub fn resolve_runner(descriptor: &Descriptor) -> Result<PathBuf> {
    if descriptor.runner.is_empty() {
        which::which("wine").map_err(|_| Error::InvalidRunner("wine".into()))
    } else {
        let runner = PathBuf::from(&descriptor.runner);
        if RunnerRegistry::validate(&runner) {
            Ok(runner)
        } else {
            Err(Error::InvalidRunner(runner))
        }
    }
}

/// Fresh per-launch identity
pub fn new_unique_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Single-quote a string for `sh -c`
fn sh_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "_-./".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const HASH: &str = "abc0000000000000000000000000000000000000000000000000000000000000";

    /// A runner that answers `--version` and otherwise runs the "exe"
    /// as a shell script
    pub(crate) fn fake_runner(dir: &Path) -> PathBuf {
        let bin = dir.join("runner/bin");
        fs::create_dir_all(&bin).unwrap();
        let wine = bin.join("wine");
        fs::write(
            &wine,
            "#!/bin/sh\nif [ \"$1\" = --version ]; then echo wine-9.0; exit 0; fi\nexec sh \"$@\"\n",
        )
        .unwrap();
        fs::set_permissions(&wine, fs::Permissions::from_mode(0o755)).unwrap();
        wine
    }

    pub(crate) fn write_charm(
        prefix: &Path,
        exe_name: &str,
        exe_body: &str,
        runner: &Path,
        args: &str,
    ) -> PathBuf {
        fs::create_dir_all(prefix.join("drive_c/app")).unwrap();
        let exe = prefix.join("drive_c/app").join(exe_name);
        fs::write(&exe, exe_body).unwrap();
        let d = Descriptor {
            sha256sum: HASH.into(),
            exe_file: exe,
            script_path: prefix.join("game.charm"),
            wineprefix: prefix.to_path_buf(),
            progname: "game".into(),
            args: args.into(),
            env_vars: "CHARM_TEST_VAR=42".into(),
            runner: runner.to_string_lossy().into_owned(),
            wine_debug: "-all".into(),
            mtime: None,
        };
        d.save().unwrap();
        d.script_path
    }

    #[test]
    fn launch_runs_exe_and_captures_stderr() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        let prefix = tmp.path().join("pfx");
        let charm = write_charm(
            &prefix,
            "game.exe",
            "echo \"var=$CHARM_TEST_VAR id=$WINECHARM_UNIQUE_ID path=$PATH\" >&2\nexit 0\n",
            &runner,
            "",
        );

        let mut launched = launch(&charm).unwrap();
        let status = launched.child.wait().unwrap();
        assert!(status.success());
        assert_eq!(launched.key, HASH);
        assert_eq!(launched.exe_name, "game.exe");
        assert_eq!(launched.exe_parent, "app");

        let log = fs::read_to_string(&launched.log).unwrap();
        assert!(log.contains("var=42"));
        assert!(log.contains(&format!("id={}", launched.unique_id)));
        // The runner's bin directory heads the child's PATH
        let bin = runner.parent().unwrap();
        assert!(log.contains(&format!("path={}:", bin.display())));
    }

    #[test]
    fn args_reach_the_executable() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        let prefix = tmp.path().join("pfx");
        let charm = write_charm(&prefix, "setup.exe", "echo \"args:$1:$2\" >&2\n", &runner, "/silent /noreboot");

        let mut launched = launch(&charm).unwrap();
        launched.child.wait().unwrap();
        let log = fs::read_to_string(&launched.log).unwrap();
        assert!(log.contains("args:/silent:/noreboot"));
    }

    #[test]
    fn missing_exe_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        let prefix = tmp.path().join("pfx");
        let charm = write_charm(&prefix, "gone.exe", "true\n", &runner, "");
        fs::remove_file(prefix.join("drive_c/app/gone.exe")).unwrap();
        assert!(matches!(launch(&charm), Err(Error::NotFound { .. })));
    }

    #[test]
    fn bad_runner_is_invalid_runner() {
        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("pfx");
        let charm = write_charm(&prefix, "app.exe", "true\n", Path::new("/no/such/wine"), "");
        assert!(matches!(launch(&charm), Err(Error::InvalidRunner(_))));
    }

    #[test]
    fn vanished_descriptor_fails_reload() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            launch(&tmp.path().join("gone.charm")),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn quoting_survives_spaces_and_quotes() {
        assert_eq!(sh_quote("plain-name.exe"), "plain-name.exe");
        assert_eq!(sh_quote("My Game.exe"), "'My Game.exe'");
        assert_eq!(sh_quote("o'brien"), r#"'o'\''brien'"#);
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn unique_ids_are_distinct() {
        let a = new_unique_id();
        let b = new_unique_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
