// src/launch/procscan.rs

//! Process discovery through `/proc`
//!
//! Wine processes fork freely and re-exec through the loader, so the
//! direct child's PID is a weak handle. What survives every respawn is
//! the environment: the launcher plants a unique id there, and the
//! scanner finds descendants by reading `/proc/<pid>/environ`.
//! Unreadable processes (other users') are silently skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Every numeric entry under `/proc`
pub fn all_pids() -> Vec<i32> {
    let mut pids = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        if let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() {
            pids.push(pid);
        }
    }
    pids
}

/// NUL-separated environment of a process, if readable
fn environ(pid: i32) -> Option<Vec<String>> {
    let bytes = fs::read(format!("/proc/{pid}/environ")).ok()?;
    Some(
        bytes
            .split(|&b| b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect(),
    )
}

/// Value of one environment variable in a process
pub fn environ_value(pid: i32, key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    environ(pid)?
        .into_iter()
        .find_map(|entry| entry.strip_prefix(&prefix).map(str::to_string))
}

/// PIDs whose environment carries `KEY=value` exactly
pub fn pids_with_env(key: &str, value: &str) -> Vec<i32> {
    let own = std::process::id() as i32;
    let needle = format!("{key}={value}");
    all_pids()
        .into_iter()
        .filter(|&pid| pid != own)
        .filter(|&pid| {
            environ(pid)
                .map(|env| env.iter().any(|e| e == &needle))
                .unwrap_or(false)
        })
        .collect()
}

/// Command-line arguments of a process
fn cmdline(pid: i32) -> Option<Vec<String>> {
    let bytes = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(
        bytes
            .split(|&b| b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect(),
    )
}

/// PIDs whose command line names the executable: some argument's
/// basename equals `exe_name` while its directory's basename equals
/// `exe_parent`, or (for Wine children started with a bare basename)
/// an argument equals `exe_name` and the process `cwd` basename equals
/// `exe_parent`.
pub fn pids_running_exe(exe_name: &str, exe_parent: &str) -> Vec<i32> {
    let own = std::process::id() as i32;
    all_pids()
        .into_iter()
        .filter(|&pid| pid != own)
        .filter(|&pid| {
            let Some(args) = cmdline(pid) else {
                return false;
            };
            args.iter().any(|arg| {
                let path = Path::new(arg);
                let name_matches = path
                    .file_name()
                    .map(|n| n.to_string_lossy() == exe_name)
                    .unwrap_or(false);
                if !name_matches {
                    return false;
                }
                match path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    Some(parent) => parent
                        .file_name()
                        .map(|n| n.to_string_lossy() == exe_parent)
                        .unwrap_or(false),
                    None => cwd_basename(pid)
                        .map(|cwd| cwd == exe_parent)
                        .unwrap_or(false),
                }
            })
        })
        .collect()
}

fn cwd_basename(pid: i32) -> Option<String> {
    let cwd: PathBuf = fs::read_link(format!("/proc/{pid}/cwd")).ok()?;
    cwd.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// PIDs whose `WINEPREFIX` resolves to `prefix`
pub fn pids_in_prefix(prefix: &Path) -> Vec<i32> {
    let own = std::process::id() as i32;
    all_pids()
        .into_iter()
        .filter(|&pid| pid != own)
        .filter(|&pid| {
            environ_value(pid, "WINEPREFIX")
                .map(|v| Path::new(&v) == prefix)
                .unwrap_or(false)
        })
        .collect()
}

/// True while the PID exists and is not a zombie
pub fn is_alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => {
            // State is the field after the parenthesized comm
            stat.rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map(|state| state != "Z")
                .unwrap_or(false)
        }
        Err(_) => false,
    }
}
