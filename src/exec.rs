// src/exec.rs

//! External process execution
//!
//! Every Wine-side subprocess (wineboot, component installers, the
//! launched executable itself) is started in its own process group so
//! cancellation can TERM/KILL the whole family, and waited on with a
//! bounded poll so the stop flag is observed at least every 100 ms.

use crate::error::{Error, Result};
use crate::task::{TaskControl, STOP_POLL};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;
use wait_timeout::ChildExt;

/// Spawn `cmd` in a fresh process group
pub fn spawn_in_group(cmd: &mut Command) -> Result<Child> {
    cmd.process_group(0);
    let program = cmd.get_program().to_string_lossy().into_owned();
    let child = cmd
        .spawn()
        .map_err(|e| Error::External {
            step: "spawn",
            status: "failed".into(),
            stderr: format!("{program}: {e}"),
        })?;
    debug!("spawned {} (pid {})", program, child.id());
    Ok(child)
}

/// Run `cmd` to completion under `ctl`, capturing stderr for the
/// error report. Used by pipeline steps whose output matters only on
/// failure.
pub fn run_step(cmd: &mut Command, ctl: &TaskControl, step: &'static str) -> Result<()> {
    ctl.check()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let mut child = spawn_in_group(cmd)?;
    let stderr_pipe = child.stderr.take();
    ctl.set_current_group(Some(child.id() as i32));

    // Drain stderr on a helper thread so the child can't block on a
    // full pipe while we poll for exit.
    let reader = std::thread::spawn(move || {
        use std::io::Read;
        let mut buf = String::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });

    let waited = loop {
        match child.wait_timeout(STOP_POLL) {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                if ctl.stop_flag().is_stopped() {
                    let _ = child.wait();
                    break Err(Error::Cancelled);
                }
            }
            Err(e) => break Err(Error::Io(e)),
        }
    };
    ctl.set_current_group(None);
    let stderr = reader.join().unwrap_or_default();
    let status = waited?;

    if !status.success() {
        return Err(Error::External {
            step,
            status: status
                .code()
                .map(|c| format!("exit code {c}"))
                .unwrap_or_else(|| "signal".into()),
            stderr: last_chunk(&stderr),
        });
    }
    Ok(())
}

/// Run `cmd` with a hard timeout, returning success. Used for runner
/// validation (`wine --version`), where any failure mode means "not a
/// runner".
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> bool {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.process_group(0);
    let Ok(mut child) = cmd.spawn() else {
        return false;
    };
    let deadline = Instant::now() + timeout;
    loop {
        match child.wait_timeout(STOP_POLL) {
            Ok(Some(status)) => return status.success(),
            Ok(None) => {
                if Instant::now() >= deadline {
                    crate::task::terminate_group(child.id() as i32, Duration::from_millis(200));
                    let _ = child.wait();
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
}

/// Last stderr chunk for error dialogs; whole captures can be huge
fn last_chunk(stderr: &str) -> String {
    const CHUNK: usize = 2048;
    let trimmed = stderr.trim_end();
    if trimmed.len() <= CHUNK {
        return trimmed.to_string();
    }
    let cut = trimmed.len() - CHUNK;
    let cut = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= cut)
        .unwrap_or(cut);
    trimmed[cut..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_step_success() {
        let ctl = TaskControl::new();
        run_step(&mut Command::new("true"), &ctl, "noop").unwrap();
    }

    #[test]
    fn run_step_failure_captures_stderr() {
        let ctl = TaskControl::new();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        match run_step(&mut cmd, &ctl, "demo") {
            Err(Error::External { step, status, stderr }) => {
                assert_eq!(step, "demo");
                assert_eq!(status, "exit code 3");
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn run_step_honors_pre_set_stop() {
        let ctl = TaskControl::new();
        ctl.cancel();
        assert!(matches!(
            run_step(&mut Command::new("true"), &ctl, "noop"),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn cancel_interrupts_long_child() {
        let ctl = TaskControl::new();
        let canceller = ctl.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            canceller.cancel();
        });
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let result = run_step(&mut cmd, &ctl, "sleep");
        handle.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_kills_runaway_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        assert!(!run_with_timeout(&mut cmd, Duration::from_millis(300)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_passes_fast_child() {
        assert!(run_with_timeout(&mut Command::new("true"), Duration::from_secs(5)));
        assert!(!run_with_timeout(&mut Command::new("false"), Duration::from_secs(5)));
    }

    #[test]
    fn last_chunk_truncates() {
        let big = "x".repeat(5000);
        assert_eq!(last_chunk(&big).len(), 2048);
        assert_eq!(last_chunk("small"), "small");
    }
}
