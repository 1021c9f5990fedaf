//! Per-process I/O relay engine (spec §4.6): pumps bytes between a child's
//! pipes or pseudo-terminal and its host-side stdio sockets, sharing the
//! event poller with every other managed process.

pub mod pair;
pub mod pipe;
pub mod pty;

pub use pair::PairState;
pub use pipe::PipeRelay;
pub use pty::PtyRelay;

use vminit_common::AgentError;
use vminit_poller::PollerHandle;

/// Tagged union over the two I/O plumbing shapes a managed process can have
/// (spec §4.6, §9 "I/O plumbing polymorphism" — "model as a tagged variant
/// or trait with two implementations"; a plain enum is enough here since
/// there are exactly two shapes and both live in this crate).
pub enum IoPlumbing {
    Pipes(PipeRelay),
    Pty(PtyRelay),
}

impl IoPlumbing {
    pub fn close_stdin(&mut self, poller: &PollerHandle) {
        match self {
            Self::Pipes(relay) => relay.close_stdin(poller),
            Self::Pty(relay) => relay.close_stdin(poller),
        }
    }

    pub fn close(&mut self, poller: &PollerHandle) {
        match self {
            Self::Pipes(relay) => relay.close(poller),
            Self::Pty(relay) => relay.close(poller),
        }
    }

    /// Only meaningful for terminal plumbing; non-terminal plumbing has no
    /// geometry to resize (spec §4.6: "Terminal detection chooses shape at
    /// process creation and cannot change").
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), AgentError> {
        match self {
            Self::Pipes(_) => Ok(()),
            Self::Pty(relay) => relay.resize(rows, cols),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Pty(_))
    }
}
