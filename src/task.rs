// src/task.rs

//! Cooperative cancellation and worker plumbing
//!
//! Long operations (archive create/extract, template init, component
//! install, directory copy, supervision) run on plain worker threads.
//! Each pipeline owns a [`TaskControl`]: a shared stop flag plus the
//! process-group id of whatever external process is currently running.
//! `cancel()` is idempotent and safe from any thread: it sets the flag
//! and escalates TERM -> KILL on the recorded group.
//!
//! Results travel back over an [`EventQueue`], the thread-safe stand-in
//! for a main-loop "idle add": workers post closures, the owning loop
//! drains and runs them.

use crate::error::{Error, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// Interval at which blocking workers must poll the stop flag
pub const STOP_POLL: Duration = Duration::from_millis(100);

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Bail out of a pipeline step when cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-pipeline control block: stop flag + current external process
#[derive(Debug, Clone, Default)]
pub struct TaskControl {
    stop: StopFlag,
    /// pgid of the external process currently owned by the pipeline.
    /// One mutex so cancellation and completion cannot race.
    current_group: Arc<Mutex<Option<i32>>>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn check(&self) -> Result<()> {
        self.stop.check()
    }

    /// Record the group of a just-spawned external process
    pub fn set_current_group(&self, pgid: Option<i32>) {
        if let Ok(mut guard) = self.current_group.lock() {
            *guard = pgid;
        }
    }

    /// Set the stop flag and TERM -> KILL the current process group.
    /// Safe to call repeatedly and from any thread.
    pub fn cancel(&self) {
        self.stop.stop();
        let pgid = self.current_group.lock().ok().and_then(|g| *g);
        if let Some(pgid) = pgid {
            terminate_group(pgid, TERM_GRACE);
        }
    }
}

/// SIGTERM a process group, wait up to `grace`, then SIGKILL survivors
pub fn terminate_group(pgid: i32, grace: Duration) {
    let group = Pid::from_raw(pgid);
    debug!("terminating process group {}", pgid);
    if killpg(group, Signal::SIGTERM).is_err() {
        return; // group already gone
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        // Signal 0 probes for liveness without delivering anything
        if killpg(group, None).is_err() {
            return;
        }
        thread::sleep(STOP_POLL);
    }
    if killpg(group, Signal::SIGKILL).is_ok() {
        warn!("process group {} survived SIGTERM, sent SIGKILL", pgid);
    }
}

/// A closure posted from a worker to the owning loop
pub type IdleJob = Box<dyn FnOnce() + Send + 'static>;

/// Worker-to-main-loop hand-off queue
pub struct EventQueue {
    tx: Sender<IdleJob>,
    rx: Receiver<IdleJob>,
}

/// Cloneable posting half of an [`EventQueue`]
#[derive(Clone)]
pub struct EventPoster {
    tx: Sender<IdleJob>,
}

impl EventPoster {
    /// Queue a closure for the owning loop; a closed queue means the
    /// loop is shutting down and the job is dropped.
    pub fn post<F: FnOnce() + Send + 'static>(&self, job: F) {
        let _ = self.tx.send(Box::new(job));
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self { tx, rx }
    }

    pub fn poster(&self) -> EventPoster {
        EventPoster {
            tx: self.tx.clone(),
        }
    }

    /// Run every queued job without blocking
    pub fn drain(&self) {
        loop {
            match self.rx.try_recv() {
                Ok(job) => job(),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Block for one job, with a timeout (supervision loops, tests)
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a named worker thread
pub fn spawn_worker<F>(name: &str, f: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .unwrap_or_else(|e| panic!("cannot spawn worker thread {name}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_check() {
        let flag = StopFlag::new();
        assert!(flag.check().is_ok());
        flag.stop();
        assert!(matches!(flag.check(), Err(Error::Cancelled)));
        // Clones share state
        let clone = flag.clone();
        assert!(clone.is_stopped());
    }

    #[test]
    fn cancel_is_idempotent() {
        let ctl = TaskControl::new();
        ctl.cancel();
        ctl.cancel();
        assert!(ctl.check().is_err());
    }

    #[test]
    fn event_queue_roundtrip() {
        let queue = EventQueue::new();
        let poster = queue.poster();
        let hits = Arc::new(AtomicBool::new(false));
        let hits2 = hits.clone();
        spawn_worker("test-post", move || {
            poster.post(move || hits2.store(true, Ordering::SeqCst));
        })
        .join()
        .unwrap();
        assert!(queue.run_one(Duration::from_secs(1)));
        assert!(hits.load(Ordering::SeqCst));
    }

    #[test]
    fn drain_runs_all_pending() {
        let queue = EventQueue::new();
        let poster = queue.poster();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..5 {
            let c = count.clone();
            poster.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.drain();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn terminate_missing_group_is_quiet() {
        // A pgid that certainly has no group anymore
        terminate_group(i32::MAX - 7, Duration::from_millis(10));
    }
}
