// src/launch/supervisor.rs

//! Per-descriptor supervision threads and the running-process table
//!
//! One worker per launched descriptor waits on the direct child. When
//! it exits the worker scans for survivors: anything still carrying
//! the launch's unique id, or a process whose command line names the
//! same executable in the same directory, counts as a respawn and
//! keeps the entry alive. Only when the whole family is gone does the
//! entry leave the table.
//!
//! Termination never trusts the recorded PID alone: it resolves the
//! live family through the unique id first, and falls back to
//! `wineserver -k` when nothing resolves.

use super::procscan;
use super::{launch, EXIT_USER_CANCEL, UNIQUE_ID_VAR};
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::exec;
use crate::notify::{Notifier, ProcessState};
use crate::task::{spawn_worker, terminate_group, STOP_POLL, TERM_GRACE};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Extra scan delay after the direct child exits, giving a respawning
/// loader time to surface
const RESPAWN_GRACE: Duration = Duration::from_millis(500);

/// One running descriptor
#[derive(Debug, Clone)]
pub struct RunningEntry {
    pub pid: i32,
    pub unique_id: String,
    pub exe_name: String,
    pub exe_parent: String,
    pub wineprefix: PathBuf,
    pub runner: PathBuf,
    pub log: PathBuf,
    pub manually_stopped: Arc<AtomicBool>,
}

impl RunningEntry {
    /// Every live PID belonging to this entry
    fn family(&self) -> Vec<i32> {
        let mut pids = procscan::pids_with_env(UNIQUE_ID_VAR, &self.unique_id);
        if pids.is_empty() {
            pids = procscan::pids_running_exe(&self.exe_name, &self.exe_parent);
        }
        pids.retain(|&pid| procscan::is_alive(pid));
        pids
    }
}

/// Supervises launched descriptors and owns the running-process table
#[derive(Clone)]
pub struct Supervisor {
    table: Arc<Mutex<HashMap<String, RunningEntry>>>,
    notifier: Arc<dyn Notifier>,
}

impl Supervisor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            notifier,
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.table.lock().map(|t| t.contains_key(key)).unwrap_or(false)
    }

    pub fn running_keys(&self) -> Vec<String> {
        self.table
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Launch the descriptor at `charm` and supervise it. Returns the
    /// catalog key. A key that is already running is an error; stop it
    /// first.
    pub fn start(&self, charm: &std::path::Path) -> Result<String> {
        let launched = launch(charm)?;
        let key = launched.key.clone();
        if self.is_running(&key) {
            // Reap the duplicate spawn before refusing
            let mut child = launched.child;
            terminate_group(child.id() as i32, TERM_GRACE);
            let _ = child.wait();
            return Err(Error::invalid("launch", format!("{key} is already running")));
        }
        self.notifier.process_state(&key, ProcessState::Starting);

        let entry = RunningEntry {
            pid: launched.child.id() as i32,
            unique_id: launched.unique_id,
            exe_name: launched.exe_name,
            exe_parent: launched.exe_parent,
            wineprefix: launched.wineprefix,
            runner: launched.runner,
            log: launched.log,
            manually_stopped: Arc::new(AtomicBool::new(false)),
        };
        self.insert(&key, entry.clone());
        self.notifier.process_state(&key, ProcessState::Running);

        let supervisor = self.clone();
        let thread_key = key.clone();
        spawn_worker(&format!("supervise-{}", &key[..10]), move || {
            supervisor.supervise(thread_key, entry, Some(launched.child));
        });
        Ok(key)
    }

    /// Adopt already-running Wine families belonging to catalog
    /// descriptors (start-up reconciliation). Returns the adopted keys.
    pub fn reconcile(&self, catalog: &Catalog) -> Vec<String> {
        let mut adopted = Vec::new();
        for descriptor in catalog.iter() {
            if self.is_running(&descriptor.sha256sum) {
                continue;
            }
            let in_prefix = procscan::pids_in_prefix(&descriptor.wineprefix);
            if in_prefix.is_empty() {
                continue;
            }
            let exe_name = descriptor
                .exe_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let exe_parent = descriptor
                .exe_file
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let running = procscan::pids_running_exe(&exe_name, &exe_parent);
            let Some(&pid) = running.iter().find(|pid| in_prefix.contains(pid)) else {
                continue;
            };

            // Recover the planted id when the family still carries one
            let unique_id =
                procscan::environ_value(pid, UNIQUE_ID_VAR).unwrap_or_default();
            info!(
                "adopting running process {} for {} (pid {})",
                exe_name, descriptor.progname, pid
            );
            let entry = RunningEntry {
                pid,
                unique_id,
                exe_name,
                exe_parent,
                wineprefix: descriptor.wineprefix.clone(),
                runner: PathBuf::from(&descriptor.runner),
                log: descriptor.log_path(),
                manually_stopped: Arc::new(AtomicBool::new(false)),
            };
            let key = descriptor.sha256sum.clone();
            self.insert(&key, entry.clone());
            self.notifier.process_state(&key, ProcessState::Running);

            let supervisor = self.clone();
            let thread_key = key.clone();
            spawn_worker(&format!("supervise-{}", &key[..10]), move || {
                supervisor.supervise(thread_key, entry, None);
            });
            adopted.push(key);
        }
        adopted
    }

    /// Terminate a running descriptor's whole family.
    pub fn stop(&self, key: &str) -> Result<()> {
        let entry = self
            .table
            .lock()
            .map_err(|_| Error::Fatal("process table poisoned".into()))?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::invalid("stop", format!("{key} is not running")))?;

        entry.manually_stopped.store(true, Ordering::SeqCst);
        let mut pids = if entry.unique_id.is_empty() {
            Vec::new()
        } else {
            procscan::pids_with_env(UNIQUE_ID_VAR, &entry.unique_id)
        };
        if pids.is_empty() && procscan::is_alive(entry.pid) {
            pids.push(entry.pid);
        }

        if pids.is_empty() {
            debug!("no PIDs resolve for {}, falling back to wineserver -k", key);
            return wineserver_kill(&entry);
        }
        terminate_pids(&pids);
        Ok(())
    }

    /// Worker body: wait out the direct child (when there is one),
    /// then track the family through respawns until it is gone.
    fn supervise(&self, key: String, entry: RunningEntry, child: Option<Child>) {
        let exit_code = match child {
            Some(mut child) => match child.wait() {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("wait failed for {}: {}", key, e);
                    None
                }
            },
            None => {
                self.wait_for_pid(entry.pid);
                None
            }
        };
        self.notifier.process_state(&key, ProcessState::Ending);

        // Respawn loop: as long as anything from the family survives,
        // the descriptor counts as running.
        loop {
            std::thread::sleep(RESPAWN_GRACE);
            let family = entry.family();
            let Some(&pid) = family.first() else { break };
            debug!("{} respawned as pid {}", entry.exe_name, pid);
            self.notifier.process_state(&key, ProcessState::Respawned);
            self.notifier.process_state(&key, ProcessState::Running);
            self.wait_for_pid(pid);
            self.notifier.process_state(&key, ProcessState::Ending);
        }

        self.table.lock().map(|mut t| t.remove(&key)).ok();
        let stopped = entry.manually_stopped.load(Ordering::SeqCst);
        match exit_code {
            Some(code) if code != 0 && code != EXIT_USER_CANCEL && !stopped => {
                self.notifier.error_dialog(
                    "Process failed",
                    &format!("{} exited with code {}", entry.exe_name, code),
                    Some(entry.log.clone()),
                );
            }
            _ => {}
        }
        self.notifier.process_state(&key, ProcessState::Idle);
    }

    /// Poll a foreign PID (no child handle to wait on)
    fn wait_for_pid(&self, pid: i32) {
        while procscan::is_alive(pid) {
            std::thread::sleep(STOP_POLL);
        }
    }

    fn insert(&self, key: &str, entry: RunningEntry) {
        if let Ok(mut table) = self.table.lock() {
            table.insert(key.to_string(), entry);
        }
    }
}

/// TERM each PID, wait out the grace period, KILL survivors
fn terminate_pids(pids: &[i32]) {
    for &pid in pids {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if pids.iter().all(|&pid| !procscan::is_alive(pid)) {
            return;
        }
        std::thread::sleep(STOP_POLL);
    }
    for &pid in pids {
        if procscan::is_alive(pid) {
            warn!("pid {} survived SIGTERM, sending SIGKILL", pid);
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

/// `wineserver -k` against the entry's prefix, preferring the
/// wineserver next to its runner
fn wineserver_kill(entry: &RunningEntry) -> Result<()> {
    let sibling = entry.runner.with_file_name("wineserver");
    let wineserver = if sibling.is_file() {
        sibling
    } else {
        which::which("wineserver").map_err(|_| Error::InvalidRunner("wineserver".into()))?
    };
    let mut cmd = Command::new(wineserver);
    cmd.arg("-k").env("WINEPREFIX", &entry.wineprefix);
    if exec::run_with_timeout(&mut cmd, Duration::from_secs(5)) {
        Ok(())
    } else {
        Err(Error::External {
            step: "wineserver -k",
            status: "failed".into(),
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::tests::{fake_runner, write_charm};
    use crate::notify::ProcessState;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        states: StdMutex<Vec<ProcessState>>,
        dialogs: StdMutex<Vec<String>>,
    }

    impl Notifier for Recording {
        fn status(&self, _m: &str) {}
        fn info_dialog(&self, _t: &str, _b: &str) {}
        fn error_dialog(&self, title: &str, _b: &str, _log: Option<PathBuf>) {
            self.dialogs.lock().unwrap().push(title.to_string());
        }
        fn process_state(&self, _k: &str, state: ProcessState) {
            self.states.lock().unwrap().push(state);
        }
    }

    fn wait_until_idle(sup: &Supervisor, key: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while sup.is_running(key) {
            assert!(Instant::now() < deadline, "supervision never finished");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn clean_exit_runs_full_state_machine() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        let charm = write_charm(&tmp.path().join("pfx"), "clean.exe", "exit 0\n", &runner, "");
        let notifier = Arc::new(Recording::default());
        let sup = Supervisor::new(notifier.clone());

        let key = sup.start(&charm).unwrap();
        assert!(sup.is_running(&key));
        wait_until_idle(&sup, &key, Duration::from_secs(10));

        let states = notifier.states.lock().unwrap().clone();
        assert_eq!(states.first(), Some(&ProcessState::Starting));
        assert!(states.contains(&ProcessState::Running));
        assert!(states.contains(&ProcessState::Ending));
        assert_eq!(states.last(), Some(&ProcessState::Idle));
        assert!(notifier.dialogs.lock().unwrap().is_empty());
    }

    #[test]
    fn nonzero_exit_surfaces_error_with_log() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        let charm = write_charm(&tmp.path().join("pfx"), "crash.exe", "echo boom >&2\nexit 7\n", &runner, "");
        let notifier = Arc::new(Recording::default());
        let sup = Supervisor::new(notifier.clone());

        let key = sup.start(&charm).unwrap();
        wait_until_idle(&sup, &key, Duration::from_secs(10));
        assert_eq!(notifier.dialogs.lock().unwrap().len(), 1);
    }

    #[test]
    fn exit_code_two_is_silent() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        let charm = write_charm(&tmp.path().join("pfx"), "cancel.exe", "exit 2\n", &runner, "");
        let notifier = Arc::new(Recording::default());
        let sup = Supervisor::new(notifier.clone());

        let key = sup.start(&charm).unwrap();
        wait_until_idle(&sup, &key, Duration::from_secs(10));
        assert!(notifier.dialogs.lock().unwrap().is_empty());
    }

    #[test]
    fn respawn_keeps_entry_alive() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        // The "installer" hands off to a background survivor that
        // inherits the planted id, then exits
        let charm = write_charm(
            &tmp.path().join("pfx"),
            "handoff.exe",
            "sleep 2 &\nexit 0\n",
            &runner,
            "",
        );
        let notifier = Arc::new(Recording::default());
        let sup = Supervisor::new(notifier.clone());

        let key = sup.start(&charm).unwrap();
        // Shortly after the direct child exits the entry must still be
        // present (the background sleep carries the id)
        std::thread::sleep(Duration::from_millis(1200));
        assert!(sup.is_running(&key));
        wait_until_idle(&sup, &key, Duration::from_secs(15));

        let states = notifier.states.lock().unwrap().clone();
        assert!(states.contains(&ProcessState::Respawned));
        assert_eq!(states.last(), Some(&ProcessState::Idle));
        assert!(notifier.dialogs.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_terminates_family_silently() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        let charm = write_charm(&tmp.path().join("pfx"), "longrun.exe", "sleep 30\nexit 7\n", &runner, "");
        let notifier = Arc::new(Recording::default());
        let sup = Supervisor::new(notifier.clone());

        let key = sup.start(&charm).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        sup.stop(&key).unwrap();
        wait_until_idle(&sup, &key, Duration::from_secs(10));
        // Killed by signal with manually_stopped set: no dialog
        assert!(notifier.dialogs.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_unknown_key_is_invalid() {
        let sup = Supervisor::new(Arc::new(crate::notify::SilentNotifier));
        assert!(matches!(sup.stop("feed"), Err(Error::Invalid { .. })));
    }

    #[test]
    fn duplicate_start_refused() {
        let tmp = TempDir::new().unwrap();
        let runner = fake_runner(tmp.path());
        let charm = write_charm(&tmp.path().join("pfx"), "dup.exe", "sleep 10\n", &runner, "");
        let sup = Supervisor::new(Arc::new(crate::notify::SilentNotifier));

        let key = sup.start(&charm).unwrap();
        assert!(matches!(sup.start(&charm), Err(Error::Invalid { .. })));
        sup.stop(&key).unwrap();
        wait_until_idle(&sup, &key, Duration::from_secs(10));
    }
}
