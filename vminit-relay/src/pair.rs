//! A single one-directional byte pump: source readable → sink write
//! (spec §4.6 "Pipe relay").

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::unistd::{close, read, write};
use tokio::sync::Notify;
use tracing::{debug, warn};
use vminit_poller::{Interest, PollerHandle, Readiness};

const PAGE_SIZE: usize = 4096;

/// Shared completion signal for one relay pair: set once both endpoints are
/// closed, so an owner can `notified().await` it without polling.
pub struct PairState {
    closed: AtomicBool,
    notify: Notify,
}

impl PairState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.notify.notified().await;
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// One `source → sink` relay registered with the poller. Dropping this value
/// does not close the fds by itself — call [`RelayPair::close`] (idempotent)
/// or let the callback's own EOF/error handling do it.
pub struct RelayPair {
    source: RawFd,
    sink: RawFd,
    state: Arc<PairState>,
}

impl RelayPair {
    /// Register `source` as readable with the poller; bytes read are
    /// written in full to `sink` (a short write aborts the pair, per
    /// spec §4.6).
    pub fn spawn(poller: &PollerHandle, source: RawFd, sink: RawFd) -> Result<Self, vminit_common::AgentError> {
        let state = PairState::new();
        let callback_state = state.clone();

        poller.add(
            source,
            Interest::READABLE,
            Box::new(move |readiness, handle| {
                on_readable(readiness, handle, source, sink, &callback_state);
            }),
        )?;

        Ok(Self { source, sink, state })
    }

    pub fn state(&self) -> &Arc<PairState> {
        &self.state
    }

    /// Tear down both endpoints and deregister the source, regardless of
    /// whether EOF was ever observed. Idempotent.
    pub fn close(&self, poller: &PollerHandle) {
        if self.state.is_closed() {
            return;
        }
        poller.delete(self.source);
        let _ = close(self.source);
        let _ = close(self.sink);
        self.state.mark_closed();
    }
}

fn on_readable(readiness: Readiness, handle: &PollerHandle, source: RawFd, sink: RawFd, state: &Arc<PairState>) {
    if state.is_closed() {
        return;
    }

    if readiness.readable {
        let mut buf = [0u8; PAGE_SIZE];
        loop {
            match read(source, &mut buf) {
                Ok(0) => {
                    close_pair(handle, source, sink, state);
                    return;
                }
                Ok(n) => {
                    if let Err(e) = write_all(sink, &buf[..n]) {
                        warn!("relay write failed on fd {sink}: {e}");
                        close_pair(handle, source, sink, state);
                        return;
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    debug!("relay read failed on fd {source}: {e}");
                    close_pair(handle, source, sink, state);
                    return;
                }
            }
        }
    }

    if readiness.hangup || readiness.read_hangup {
        close_pair(handle, source, sink, state);
    }
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<(), Errno> {
    while !buf.is_empty() {
        match write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, buf) {
            Ok(0) => return Err(Errno::EPIPE),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn close_pair(handle: &PollerHandle, source: RawFd, sink: RawFd, state: &Arc<PairState>) {
    if state.is_closed() {
        return;
    }
    handle.delete(source);
    let _ = close(source);
    let _ = close(sink);
    state.mark_closed();
}
