//! Three one-directional pairs wiring a non-terminal process's stdio pipes
//! to host sockets (spec §4.6 "Pipe relay (non-terminal)").

use std::os::fd::RawFd;

use vminit_common::AgentError;
use vminit_poller::PollerHandle;

use crate::pair::RelayPair;

/// stdin/stdout/stderr relays for one non-terminal process.
pub struct PipeRelay {
    stdin: Option<RelayPair>,
    stdout: RelayPair,
    stderr: RelayPair,
}

impl PipeRelay {
    /// `host_stdin` is optional: a process created without a stdin host
    /// socket simply never relays input.
    pub fn new(
        poller: &PollerHandle,
        host_stdin: Option<RawFd>,
        child_stdin_write: Option<RawFd>,
        child_stdout_read: RawFd,
        host_stdout: RawFd,
        child_stderr_read: RawFd,
        host_stderr: RawFd,
    ) -> Result<Self, AgentError> {
        let stdin = match (host_stdin, child_stdin_write) {
            (Some(src), Some(sink)) => Some(RelayPair::spawn(poller, src, sink)?),
            _ => None,
        };
        let stdout = RelayPair::spawn(poller, child_stdout_read, host_stdout)?;
        let stderr = RelayPair::spawn(poller, child_stderr_read, host_stderr)?;

        Ok(Self { stdin, stdout, stderr })
    }

    /// Close the stdin relay alone, leaving stdout/stderr running (spec
    /// §4.6: "`closeStdin` closes the stdin relay alone").
    pub fn close_stdin(&mut self, poller: &PollerHandle) {
        if let Some(pair) = self.stdin.take() {
            pair.close(poller);
        }
    }

    pub fn close(&mut self, poller: &PollerHandle) {
        self.close_stdin(poller);
        self.stdout.close(poller);
        self.stderr.close(poller);
    }
}
