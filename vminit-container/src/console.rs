//! Reads a PTY master fd passed over a per-container console UNIX socket
//! (spec §4.6 PTY relay shape (b): "reading the master fd from a
//! per-container console unix socket passed to an external OCI runtime").
//!
//! External OCI runtimes (runc and friends) open the PTY themselves and
//! send the master fd back over `SCM_RIGHTS` on a socket path passed via
//! `--console-socket`; this accepts exactly one such connection and message.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use std::io::IoSliceMut;

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use vminit_common::{AgentError, ErrorKind};

/// Bind a console socket at `path`, accept one connection, and extract the
/// single fd sent over `SCM_RIGHTS`. Runs the blocking accept/recv on a
/// blocking-pool thread.
pub async fn receive_master_fd(path: PathBuf) -> Result<OwnedFd, AgentError> {
    tokio::task::spawn_blocking(move || receive_master_fd_blocking(&path))
        .await
        .map_err(|e| AgentError::new(ErrorKind::Internal, "console::receive_master_fd", e.to_string()))?
}

fn receive_master_fd_blocking(path: &Path) -> Result<OwnedFd, AgentError> {
    let _ = std::fs::remove_file(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AgentError::from_errno("console::receive_master_fd", e))?;
    }
    let listener = UnixListener::bind(path).map_err(|e| AgentError::from_errno("console::receive_master_fd", e))?;
    let (stream, _addr) = listener.accept().map_err(|e| AgentError::from_errno("console::receive_master_fd", e))?;

    use std::os::fd::AsRawFd;
    let socket_fd = stream.as_raw_fd();

    let mut byte_buf = [0u8; 16];
    let mut iov = [IoSliceMut::new(&mut byte_buf)];
    let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; 1]);

    let message = recvmsg::<()>(socket_fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(|e| AgentError::new(ErrorKind::Internal, "console::receive_master_fd", format!("recvmsg failed: {e}")))?;

    for cmsg in message.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                use std::os::fd::FromRawFd;
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    Err(AgentError::new(
        ErrorKind::Internal,
        "console::receive_master_fd",
        "no file descriptor received over console socket",
    ))
}
