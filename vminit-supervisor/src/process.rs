//! A managed process and its state machine (spec §3 "Managed process").

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use tokio::sync::oneshot;
use vminit_common::{AgentError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Init,
    Exec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub when: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Creating,
    Running(Pid),
    Exited(ExitStatus),
}

type ExitHook = Box<dyn FnOnce() + Send>;

struct Inner {
    state: std::sync::Mutex<State>,
    waiters: std::sync::Mutex<Vec<oneshot::Sender<ExitStatus>>>,
    exit_hook: std::sync::Mutex<Option<ExitHook>>,
}

/// `(id, owning container id, kind, state, pid?, ...)` from spec §3. The
/// host-stdio/I/O-plumbing fields live alongside this in the container
/// manager, which owns the process's full lifecycle; this type only tracks
/// the state machine and waiter delivery the supervisor cares about.
pub struct ManagedProcess {
    id: String,
    container_id: String,
    kind: ProcessKind,
    inner: std::sync::Arc<Inner>,
}

impl ManagedProcess {
    pub fn new(id: impl Into<String>, container_id: impl Into<String>, kind: ProcessKind) -> Self {
        Self {
            id: id.into(),
            container_id: container_id.into(),
            kind,
            inner: std::sync::Arc::new(Inner {
                state: std::sync::Mutex::new(State::Initial),
                waiters: std::sync::Mutex::new(Vec::new()),
                exit_hook: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn mark_creating(&self) -> Result<(), AgentError> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            State::Initial => {
                *state = State::Creating;
                Ok(())
            }
            _ => Err(AgentError::invalid_state(
                "ManagedProcess::mark_creating",
                format!("process {} is not in the initial state", self.id),
            )),
        }
    }

    pub fn mark_running(&self, pid: Pid) -> Result<(), AgentError> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            State::Initial | State::Creating => {
                *state = State::Running(pid);
                Ok(())
            }
            _ => Err(AgentError::invalid_state(
                "ManagedProcess::mark_running",
                format!("process {} already running or exited", self.id),
            )),
        }
    }

    /// Register the I/O-plumbing teardown to run exactly once, at the
    /// moment this process transitions to `exited` (spec §4.8: the
    /// reaper "close[s] their I/O plumbing" for each reaped pid; spec §3:
    /// host-stdio sockets are "closed exactly once on process exit or
    /// delete, whichever occurs first"). Must be called before the
    /// process is handed to the supervisor, so no exit can race past an
    /// unregistered hook.
    pub fn set_exit_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.exit_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn pid(&self) -> Option<Pid> {
        match *self.inner.state.lock().unwrap() {
            State::Running(pid) => Some(pid),
            _ => None,
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *self.inner.state.lock().unwrap() {
            State::Exited(status) => Some(status),
            _ => None,
        }
    }

    /// Transition to `exited` and wake every waiter attached so far, in
    /// arrival order (spec §8: "exactly one `exited(code, when)` is
    /// delivered to every waiter attached at any time prior to or during
    /// exit"). Monotonic: a second call is a no-op, matching "exited is
    /// terminal".
    pub fn mark_exited(&self, status: ExitStatus) {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(*state, State::Exited(_)) {
            return;
        }
        *state = State::Exited(status);
        drop(state);

        if let Some(hook) = self.inner.exit_hook.lock().unwrap().take() {
            hook();
        }

        let waiters = std::mem::take(&mut *self.inner.waiters.lock().unwrap());
        for waiter in waiters {
            let _ = waiter.send(status);
        }
    }

    /// Block until the process exits. Returns immediately if it already
    /// has.
    pub async fn wait(&self) -> ExitStatus {
        let rx = {
            let mut waiters = self.inner.waiters.lock().unwrap();
            if let Some(status) = self.exit_status() {
                return status;
            }
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            rx
        };

        match rx.await {
            Ok(status) => status,
            Err(_) => self.exit_status().expect("sender dropped only after mark_exited"),
        }
    }
}

/// Map a signal number to the POSIX `128 + signal` exit-code convention
/// used for processes killed by a signal (spec §8 scenarios 3/4:
/// SIGTERM → 143, SIGKILL → 137).
pub fn exit_code_for_signal(signal: i32) -> i32 {
    128 + signal
}

pub fn invalid_process_id(op: &str, id: &str) -> AgentError {
    AgentError::new(ErrorKind::InvalidState, op, format!("unknown process id {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_running_twice_is_invalid_state() {
        let process = ManagedProcess::new("c1", "c1", ProcessKind::Init);
        process.mark_running(Pid::from_raw(100)).unwrap();
        let err = process.mark_running(Pid::from_raw(200)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn wait_after_exit_returns_immediately() {
        let process = ManagedProcess::new("c1", "c1", ProcessKind::Init);
        let status = ExitStatus { code: 143, when: Utc::now() };
        process.mark_exited(status);
        assert_eq!(process.wait().await, status);
    }

    #[tokio::test]
    async fn waiters_attached_before_exit_are_all_woken() {
        let process = std::sync::Arc::new(ManagedProcess::new("c1", "c1", ProcessKind::Init));
        let a = process.clone();
        let b = process.clone();
        let wait_a = tokio::spawn(async move { a.wait().await });
        let wait_b = tokio::spawn(async move { b.wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let status = ExitStatus { code: 137, when: Utc::now() };
        process.mark_exited(status);

        assert_eq!(wait_a.await.unwrap(), status);
        assert_eq!(wait_b.await.unwrap(), status);
    }

    #[test]
    fn signal_exit_codes_follow_128_plus_signal() {
        assert_eq!(exit_code_for_signal(15), 143);
        assert_eq!(exit_code_for_signal(9), 137);
    }
}
