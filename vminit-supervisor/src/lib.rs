//! Process-wide supervisor singleton (spec §4.8): tracks every managed
//! process, reaps SIGCHLD on its own dispatch, and wakes waiters.
//!
//! The signal stream follows the same `signal_hook_tokio::Signals::new([..])`
//! / `while let Some(_) = signals.next().await` idiom `homeroute`'s SIGHUP
//! reload handler uses, just for SIGCHLD and a reaping loop instead of a
//! config reload.

pub mod process;

pub use process::{exit_code_for_signal, ExitStatus, ManagedProcess, ProcessKind};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::stream::StreamExt;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use signal_hook::consts::SIGCHLD;
use signal_hook_tokio::Signals;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vminit_common::AgentError;

use crate::process::invalid_process_id;

const RUNTIME_EXIT_CHANNEL_CAPACITY: usize = 256;

/// Process-wide singleton coordinating SIGCHLD reaping across every
/// managed process (spec §9 "Global state... the supervisor").
pub struct Supervisor {
    by_pid: Mutex<HashMap<Pid, Arc<ManagedProcess>>>,
    by_id: Mutex<HashMap<String, Arc<ManagedProcess>>>,
    /// Broadcasts every reaped `(pid, status)` so external OCI-runtime
    /// wrapper tasks can wait on their own transient helper PIDs without
    /// calling `wait4` themselves (spec §4.8).
    runtime_exits: broadcast::Sender<(Pid, ExitStatus)>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        let (runtime_exits, _) = broadcast::channel(RUNTIME_EXIT_CHANNEL_CAPACITY);
        Arc::new(Self {
            by_pid: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
            runtime_exits,
        })
    }

    /// Subscribe before calling `start` to avoid a lost-wake race on a
    /// fast-exiting process (spec §4.8: "subscribers are registered before
    /// `start` to avoid lost-wake races on fast exits").
    pub fn subscribe_runtime_exits(&self) -> broadcast::Receiver<(Pid, ExitStatus)> {
        self.runtime_exits.subscribe()
    }

    /// Returns a wrapper usable by an external-OCI-runtime driver that
    /// waits via the supervisor's broadcast channel instead of `wait4`
    /// (spec §4.8 `getRuncWithReaper`).
    pub fn get_runc_with_reaper(&self) -> RuncReaper {
        RuncReaper { rx: self.subscribe_runtime_exits() }
    }

    /// Record `process` as running under `pid`. Rolls back registration on
    /// failure (spec §4.8 "records the process, invokes its start, rolls
    /// back registration on failure").
    pub fn start(&self, process: Arc<ManagedProcess>, pid: Pid) -> Result<(), AgentError> {
        {
            let mut by_id = self.by_id.lock().unwrap();
            if by_id.contains_key(process.id()) {
                return Err(AgentError::already_exists(
                    "Supervisor::start",
                    format!("process {} already registered", process.id()),
                ));
            }
            by_id.insert(process.id().to_string(), process.clone());
        }

        if let Err(e) = process.mark_running(pid) {
            self.by_id.lock().unwrap().remove(process.id());
            return Err(e);
        }

        self.by_pid.lock().unwrap().insert(pid, process);
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<Arc<ManagedProcess>, AgentError> {
        self.by_id
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| invalid_process_id("Supervisor::find", id))
    }

    pub fn remove(&self, id: &str) {
        if let Some(process) = self.by_id.lock().unwrap().remove(id) {
            if let Some(pid) = process.pid() {
                self.by_pid.lock().unwrap().remove(&pid);
            }
        }
    }

    /// Spawn the SIGCHLD dispatch task. Call once at boot.
    pub fn spawn_reaper(self: &Arc<Self>) -> Result<JoinHandle<()>, AgentError> {
        let signals = Signals::new([SIGCHLD])
            .map_err(|e| AgentError::from_errno("Supervisor::spawn_reaper", e))?;
        let supervisor = self.clone();
        Ok(tokio::spawn(async move {
            let mut signals = signals;
            supervisor.reap_all(); // a child may have exited before we started listening
            while signals.next().await.is_some() {
                supervisor.reap_all();
            }
        }))
    }

    /// Drain every reapable child via `waitpid(-1, WNOHANG)` (spec §4.8).
    /// For each exited PID: transition its managed process to `exited`,
    /// wake waiters, remove it, and broadcast for runtime-wrapper tasks.
    fn reap_all(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.dispatch_exit(pid, code),
                Ok(WaitStatus::Signaled(pid, signal, _core_dumped)) => {
                    self.dispatch_exit(pid, exit_code_for_signal(signal as i32))
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue, // Stopped/Continued/PtraceEvent: not a terminal transition
                Err(nix::errno::Errno::ECHILD) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid failed: {e}");
                    break;
                }
            }
        }
    }

    fn dispatch_exit(&self, pid: Pid, code: i32) {
        let status = ExitStatus { code, when: Utc::now() };
        debug!(pid = pid.as_raw(), code, "reaped child");

        let process = self.by_pid.lock().unwrap().remove(&pid);
        if let Some(process) = process {
            self.by_id.lock().unwrap().remove(process.id());
            process.mark_exited(status);
        }

        let _ = self.runtime_exits.send((pid, status));
    }
}

/// Waits on transient helper PIDs (e.g. an external OCI runtime's own
/// short-lived children) via the supervisor's broadcast channel.
pub struct RuncReaper {
    rx: broadcast::Receiver<(Pid, ExitStatus)>,
}

impl RuncReaper {
    pub async fn wait_for(&mut self, pid: Pid) -> ExitStatus {
        loop {
            match self.rx.recv().await {
                Ok((seen_pid, status)) if seen_pid == pid => return status,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    // The supervisor only drops its sender at process exit;
                    // nothing further will ever arrive for this wait.
                    return std::future::pending().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_duplicate_id() {
        let supervisor = Supervisor::new();
        let process = Arc::new(ManagedProcess::new("c1", "c1", ProcessKind::Init));
        supervisor.start(process.clone(), Pid::from_raw(123)).unwrap();

        let duplicate = Arc::new(ManagedProcess::new("c1", "c1", ProcessKind::Init));
        let err = supervisor.start(duplicate, Pid::from_raw(456)).unwrap_err();
        assert_eq!(err.kind, vminit_common::ErrorKind::AlreadyExists);
    }

    #[test]
    fn find_unknown_id_is_invalid_state() {
        let supervisor = Supervisor::new();
        let err = supervisor.find("missing").unwrap_err();
        assert_eq!(err.kind, vminit_common::ErrorKind::InvalidState);
    }

    #[test]
    fn remove_drops_both_indices() {
        let supervisor = Supervisor::new();
        let process = Arc::new(ManagedProcess::new("c1", "c1", ProcessKind::Init));
        supervisor.start(process.clone(), Pid::from_raw(789)).unwrap();
        supervisor.remove("c1");
        assert!(supervisor.find("c1").is_err());
        assert!(supervisor.by_pid.lock().unwrap().is_empty());
    }
}
