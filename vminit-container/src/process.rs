//! A managed exec process: the capability set the container manager needs
//! regardless of whether the init process was launched natively or is
//! delegated to an external OCI runtime (spec §9 "External OCI-runtime vs
//! in-process exec... expose a single `ContainerProcess` capability set").
//!
//! Combines [`vminit_supervisor::ManagedProcess`] (state machine + waiters)
//! with this process's [`vminit_relay::IoPlumbing`] (byte relay) into one
//! handle the container manager's `start`/`wait`/`kill`/`resize`/
//! `close-stdin`/`delete` operations act on.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use vminit_common::{AgentError, ErrorKind};
use vminit_poller::PollerHandle;
use vminit_relay::{pipe::PipeRelay, pty::PtyRelay, IoPlumbing};
use vminit_supervisor::{ExitStatus, ManagedProcess, ProcessKind};

use crate::spawn::{Launched, LaunchedStdio};

/// Which optional host-side stdio sockets were provided at creation time
/// (spec §3 "Host-stdio endpoints": up to three, plus a terminal flag).
#[derive(Default)]
pub struct HostStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

pub struct ManagedExec {
    managed: Arc<ManagedProcess>,
    plumbing: Arc<Mutex<Option<IoPlumbing>>>,
    poller: PollerHandle,
}

impl ManagedExec {
    pub fn id(&self) -> &str {
        self.managed.id()
    }

    pub fn kind(&self) -> ProcessKind {
        self.managed.kind()
    }

    pub fn managed(&self) -> &Arc<ManagedProcess> {
        &self.managed
    }

    pub fn pid(&self) -> Option<Pid> {
        self.managed.pid()
    }

    /// Wire a freshly-launched native process's stdio into the relay and
    /// register it with the supervisor under `pid` (spec §4.6, §4.8).
    pub fn from_native_launch(
        id: impl Into<String>,
        container_id: impl Into<String>,
        kind: ProcessKind,
        poller: PollerHandle,
        launched: Launched,
        host: HostStdio,
    ) -> Result<Self, AgentError> {
        let managed = Arc::new(ManagedProcess::new(id, container_id, kind));

        let plumbing = match launched.stdio {
            LaunchedStdio::Pipes { stdin_write, stdout_read, stderr_read } => {
                let relay = PipeRelay::new(
                    &poller,
                    host.stdin.as_ref().map(owned_raw),
                    Some(stdin_write.as_raw_fd()),
                    stdout_read.as_raw_fd(),
                    host.stdout.as_ref().map(owned_raw).unwrap_or(-1),
                    stderr_read.as_raw_fd(),
                    host.stderr.as_ref().map(owned_raw).unwrap_or(-1),
                )?;
                std::mem::forget(stdin_write);
                std::mem::forget(stdout_read);
                std::mem::forget(stderr_read);
                leak_host_fds(host);
                IoPlumbing::Pipes(relay)
            }
            LaunchedStdio::Pty { master } => {
                let master_fd = master.as_raw_fd();
                std::mem::forget(master);
                let relay = PtyRelay::new(
                    &poller,
                    master_fd,
                    host.stdin.as_ref().map(owned_raw),
                    host.stdout.as_ref().map(owned_raw).unwrap_or(-1),
                )?;
                leak_host_fds(host);
                IoPlumbing::Pty(relay)
            }
        };

        let plumbing = Arc::new(Mutex::new(Some(plumbing)));

        // Registered before this process is ever handed to the supervisor
        // (the caller enrolls it in the cgroup and starts supervision only
        // after `from_native_launch` returns), so an exit can never race
        // past an unregistered hook (spec §4.8, spec §3 "closed exactly
        // once on process exit or delete, whichever occurs first").
        {
            let plumbing = plumbing.clone();
            let poller = poller.clone();
            managed.set_exit_hook(move || {
                if let Some(mut p) = plumbing.lock().unwrap().take() {
                    p.close(&poller);
                }
            });
        }

        Ok(Self { managed, plumbing, poller })
    }

    pub async fn wait(&self) -> ExitStatus {
        self.managed.wait().await
    }

    pub fn kill(&self, signal: i32) -> Result<(), AgentError> {
        let pid = self.pid().ok_or_else(|| {
            AgentError::new(ErrorKind::InvalidState, "ManagedExec::kill", format!("process {} has no pid", self.id()))
        })?;
        let signal = Signal::try_from(signal)
            .map_err(|e| AgentError::new(ErrorKind::InvalidArgument, "ManagedExec::kill", e.to_string()))?;
        kill(pid, signal).map_err(|e| AgentError::from_errno("ManagedExec::kill", std::io::Error::from_raw_os_error(e as i32)))
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), AgentError> {
        let plumbing = self.plumbing.lock().unwrap();
        match plumbing.as_ref() {
            Some(p) => p.resize(rows, cols),
            None => Ok(()),
        }
    }

    pub fn close_stdin(&self) {
        let mut plumbing = self.plumbing.lock().unwrap();
        if let Some(p) = plumbing.as_mut() {
            p.close_stdin(&self.poller);
        }
    }

    /// Close the I/O plumbing (spec §3: "sockets are closed exactly once
    /// on process exit or delete, whichever occurs first"). Also runs from
    /// the exit hook on self-exit; both share this lock and `take()`, so
    /// whichever fires first wins.
    pub fn close_io(&self) {
        let mut plumbing = self.plumbing.lock().unwrap();
        if let Some(mut p) = plumbing.take() {
            p.close(&self.poller);
        }
    }
}

fn owned_raw(fd: &OwnedFd) -> RawFd {
    fd.as_raw_fd()
}

/// The relay now owns these fds' lifetimes (closed via `IoPlumbing::close`);
/// prevent `OwnedFd`'s drop from double-closing them.
fn leak_host_fds(host: HostStdio) {
    if let Some(fd) = host.stdin {
        std::mem::forget(fd);
    }
    if let Some(fd) = host.stdout {
        std::mem::forget(fd);
    }
    if let Some(fd) = host.stderr {
        std::mem::forget(fd);
    }
}
