//! Pseudo-terminal relay: one master fd fans out to a host-stdin pair and a
//! host-stdout pair, plus resize via `TIOCSWINSZ` (spec §4.6 "PTY relay").

use std::os::fd::RawFd;

use nix::ioctl_write_ptr_bad;
use vminit_common::{AgentError, ErrorKind};
use vminit_poller::PollerHandle;

use crate::pair::RelayPair;

/// Layout matches `struct winsize` from `<sys/ioctl.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub x_pixels: u16,
    pub y_pixels: u16,
}

ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, WindowSize);

/// stdin→master and master→stdout relays for one terminal process.
pub struct PtyRelay {
    master: RawFd,
    stdin_pair: Option<RelayPair>,
    stdout_pair: RelayPair,
}

impl PtyRelay {
    pub fn new(
        poller: &PollerHandle,
        master: RawFd,
        host_stdin: Option<RawFd>,
        host_stdout: RawFd,
    ) -> Result<Self, AgentError> {
        let stdin_pair = match host_stdin {
            Some(src) => Some(RelayPair::spawn(poller, src, dup_fd(master)?)?),
            None => None,
        };
        let stdout_pair = RelayPair::spawn(poller, master, host_stdout)?;

        Ok(Self { master, stdin_pair, stdout_pair })
    }

    /// Forward a terminal geometry change to the master (spec §4.6
    /// "Resize forwards the geometry to the master via the terminal ioctl").
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), AgentError> {
        let size = WindowSize { rows, cols, x_pixels: 0, y_pixels: 0 };
        unsafe { tiocswinsz(self.master, &size) }
            .map(|_| ())
            .map_err(|e| AgentError::new(ErrorKind::Internal, "PtyRelay::resize", format!("TIOCSWINSZ failed: {e}")))
    }

    pub fn close_stdin(&mut self, poller: &PollerHandle) {
        if let Some(pair) = self.stdin_pair.take() {
            pair.close(poller);
        }
    }

    pub fn close(&mut self, poller: &PollerHandle) {
        self.close_stdin(poller);
        self.stdout_pair.close(poller);
    }
}

fn dup_fd(fd: RawFd) -> Result<RawFd, AgentError> {
    nix::unistd::dup(fd).map_err(|e| AgentError::new(ErrorKind::Internal, "PtyRelay::new", format!("dup failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_has_ioctl_layout() {
        assert_eq!(std::mem::size_of::<WindowSize>(), 8);
    }
}
