//! In-process fork/exec launch path (spec §4.9 step 4a: "in-process exec
//! using the supervisor's own fork/exec primitives, which owns the cgroup
//! cleanup"). Mirrors the preexec/user-switch shape of
//! `linker::platform::linux::UserChangeStrategy` (set group before user,
//! bail loudly on failure) adapted to a PTY-or-pipes child instead of an
//! `execve` launcher's plain fd table.
//!
//! The child's filesystem root is confined to the container's rootfs via
//! `chroot`; `CLONE_NEWPID`/`CLONE_NEWNS`/`CLONE_NEWUTS` give it its own PID,
//! mount, and UTS namespaces (multi-tenant host-user isolation beyond this
//! is explicitly a Non-goal, spec §1).

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{
    chdir, chroot, close, dup2, execvp, fork, pipe, sethostname, setgid, setgroups, setuid, ForkResult, Gid, Pid, Uid,
};
use vminit_common::{AgentError, ErrorKind};

use crate::console;
use crate::exec_user::{fill_default_env, ResolvedUser};
use crate::spec::ProcessSpec;

/// Agent-side ends of the spawned child's stdio, plus its pid. The caller
/// wires these into [`vminit_relay::IoPlumbing`].
pub enum LaunchedStdio {
    Pipes {
        stdin_write: OwnedFd,
        stdout_read: OwnedFd,
        stderr_read: OwnedFd,
    },
    Pty {
        master: OwnedFd,
    },
}

pub struct Launched {
    pub pid: Pid,
    pub stdio: LaunchedStdio,
}

/// Fork and exec `spec` inside `rootfs`, running as `user`, with an
/// isolated PID/mount/UTS namespace. Returns once the parent has forked;
/// the child never returns from this function (it `execvp`s or `_exit`s).
pub fn launch(
    rootfs: &str,
    hostname: Option<&str>,
    spec: &ProcessSpec,
    user: &ResolvedUser,
) -> Result<Launched, AgentError> {
    if spec.terminal {
        launch_pty(rootfs, hostname, spec, user)
    } else {
        launch_pipes(rootfs, hostname, spec, user)
    }
}

fn launch_pipes(
    rootfs: &str,
    hostname: Option<&str>,
    spec: &ProcessSpec,
    user: &ResolvedUser,
) -> Result<Launched, AgentError> {
    let (stdin_read, stdin_write) = pipe().map_err(|e| nix_err("spawn::launch", e))?;
    let (stdout_read, stdout_write) = pipe().map_err(|e| nix_err("spawn::launch", e))?;
    let (stderr_read, stderr_write) = pipe().map_err(|e| nix_err("spawn::launch", e))?;

    match unsafe { fork() }.map_err(|e| nix_err("spawn::launch", e))? {
        ForkResult::Parent { child } => {
            drop(stdin_read);
            drop(stdout_write);
            drop(stderr_write);
            set_nonblocking(stdout_read.as_raw_fd())?;
            set_nonblocking(stderr_read.as_raw_fd())?;
            Ok(Launched {
                pid: child,
                stdio: LaunchedStdio::Pipes {
                    stdin_write,
                    stdout_read,
                    stderr_read,
                },
            })
        }
        ForkResult::Child => {
            drop(stdin_write);
            drop(stdout_read);
            drop(stderr_read);
            dup_onto_std_fds(stdin_read.as_raw_fd(), stdout_write.as_raw_fd(), stderr_write.as_raw_fd());
            child_exec(rootfs, hostname, spec, user);
        }
    }
}

fn launch_pty(
    rootfs: &str,
    hostname: Option<&str>,
    spec: &ProcessSpec,
    user: &ResolvedUser,
) -> Result<Launched, AgentError> {
    let OpenptyResult { master, slave } = openpty(None, None).map_err(|e| nix_err("spawn::launch", e))?;

    match unsafe { fork() }.map_err(|e| nix_err("spawn::launch", e))? {
        ForkResult::Parent { child } => {
            drop(slave);
            set_nonblocking(master.as_raw_fd())?;
            Ok(Launched {
                pid: child,
                stdio: LaunchedStdio::Pty { master },
            })
        }
        ForkResult::Child => {
            drop(master);
            let slave_fd = slave.as_raw_fd();
            dup_onto_std_fds(slave_fd, slave_fd, slave_fd);
            if slave_fd > libc::STDERR_FILENO {
                let _ = close(slave_fd);
            }
            nix::unistd::setsid().ok();
            unsafe {
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) != 0 {
                    tracing::debug!("TIOCSCTTY failed setting controlling terminal");
                }
            }
            child_exec(rootfs, hostname, spec, user);
        }
    }
}

fn dup_onto_std_fds(stdin: RawFd, stdout: RawFd, stderr: RawFd) {
    let _ = dup2(stdin, libc::STDIN_FILENO);
    let _ = dup2(stdout, libc::STDOUT_FILENO);
    let _ = dup2(stderr, libc::STDERR_FILENO);
}

/// Runs entirely in the forked child. Never returns: either `execvp`
/// replaces the image, or the child exits non-zero on setup failure.
fn child_exec(rootfs: &str, hostname: Option<&str>, spec: &ProcessSpec, user: &ResolvedUser) -> ! {
    let bail = |step: &str, err: impl std::fmt::Display| -> ! {
        eprintln!("vminitd: child setup failed at {step}: {err}");
        std::process::exit(127);
    };

    if let Err(e) = unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS) {
        bail("unshare", e);
    }
    if let Some(hostname) = hostname {
        if let Err(e) = sethostname(hostname) {
            bail("sethostname", e);
        }
    }
    if let Err(e) = chroot(rootfs) {
        bail("chroot", e);
    }
    if let Err(e) = chdir("/") {
        bail("chdir(/)", e);
    }
    if let Err(e) = setgroups(&user.supplementary_gids.iter().map(|g| Gid::from_raw(*g)).collect::<Vec<_>>()) {
        bail("setgroups", e);
    }
    if let Err(e) = setgid(Gid::from_raw(user.gid)) {
        bail("setgid", e);
    }
    if let Err(e) = setuid(Uid::from_raw(user.uid)) {
        bail("setuid", e);
    }
    if let Err(e) = chdir(spec.cwd.as_str()) {
        bail("chdir(cwd)", e);
    }

    let env = fill_default_env(&spec.env, &user.home, spec.terminal);
    let args: Vec<CString> = spec.args.iter().map(|a| CString::new(a.as_str()).unwrap()).collect();
    let envp: Vec<CString> = env.iter().map(|e| CString::new(e.as_str()).unwrap()).collect();

    if args.is_empty() {
        bail("exec", "empty argv");
    }

    // execvp does not take an explicit envp; set the process environment
    // first so the exec'd image sees it.
    for var in std::env::vars() {
        std::env::remove_var(var.0);
    }
    for entry in &envp {
        if let Ok(s) = entry.to_str() {
            if let Some((k, v)) = s.split_once('=') {
                std::env::set_var(k, v);
            }
        }
    }

    match execvp(&args[0], &args) {
        Ok(_) => unreachable!("execvp does not return on success"),
        Err(e) => bail("execvp", e),
    }
}

fn nix_err(op: &str, err: nix::Error) -> AgentError {
    AgentError::new(ErrorKind::Internal, op, format!("{err} (errno {})", err as i32))
}

/// Set `O_NONBLOCK` on an agent-side relay endpoint. The poller's callback
/// runs on its single dedicated thread and must never block (spec §4.5);
/// its read loop drains a source "until EAGAIN" (spec §4.6), which only
/// terminates if the fd is non-blocking. `pipe()`/`openpty()` hand back
/// blocking fds, so every end this process keeps and registers with the
/// poller as a readable source must be flipped here before the relay is
/// wired up, the same way `vminit-icmp` flips its raw sockets at open time.
fn set_nonblocking(fd: RawFd) -> Result<(), AgentError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| nix_err("spawn::set_nonblocking", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| nix_err("spawn::set_nonblocking", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_argv_omits_console_socket_when_not_a_terminal() {
        let argv = runtime_argv(Path::new("/run/container/c1"), "c1", None);
        assert_eq!(argv, vec!["run", "--bundle", "/run/container/c1", "c1"]);
    }

    #[test]
    fn runtime_argv_includes_console_socket_when_present() {
        let argv = runtime_argv(Path::new("/run/container/c1"), "c1", Some(Path::new("/run/container/c1/console.sock")));
        assert_eq!(
            argv,
            vec!["run", "--bundle", "/run/container/c1", "--console-socket", "/run/container/c1/console.sock", "c1"]
        );
    }
}

/// Fork and exec an external OCI runtime binary in place of an in-process
/// `execvp` (spec §4.9 step 4b: "delegated to an external OCI runtime; the
/// runtime owns its own cleanup"). The runtime performs its own rootfs
/// confinement and user switch from the bundle's `config.json`, so the
/// child here is a plain `execvp` with no `chroot`/`setuid` of our own.
///
/// For a terminal process the runtime opens the pty itself and sends the
/// master fd back over `console_socket` (spec §4.6 shape (b)); this awaits
/// that handoff before returning, so the returned [`Launched`] looks
/// identical to a native launch to the rest of the container manager.
pub async fn launch_delegated(
    runtime_path: &str,
    bundle_dir: &Path,
    container_id: &str,
    spec: &ProcessSpec,
    console_socket: Option<&Path>,
) -> Result<Launched, AgentError> {
    if spec.terminal {
        let console_socket = console_socket.ok_or_else(|| {
            AgentError::invalid_argument("spawn::launch_delegated", "terminal process requires a console socket")
        })?;
        let socket_path = console_socket.to_path_buf();
        let pid = exec_delegated_runtime(runtime_path, bundle_dir, container_id, Some(console_socket))?;
        let master = console::receive_master_fd(socket_path).await?;
        set_nonblocking(master.as_raw_fd())?;
        Ok(Launched { pid, stdio: LaunchedStdio::Pty { master } })
    } else {
        let (stdin_read, stdin_write) = pipe().map_err(|e| nix_err("spawn::launch_delegated", e))?;
        let (stdout_read, stdout_write) = pipe().map_err(|e| nix_err("spawn::launch_delegated", e))?;
        let (stderr_read, stderr_write) = pipe().map_err(|e| nix_err("spawn::launch_delegated", e))?;

        match unsafe { fork() }.map_err(|e| nix_err("spawn::launch_delegated", e))? {
            ForkResult::Parent { child } => {
                drop(stdin_read);
                drop(stdout_write);
                drop(stderr_write);
                set_nonblocking(stdout_read.as_raw_fd())?;
                set_nonblocking(stderr_read.as_raw_fd())?;
                Ok(Launched {
                    pid: child,
                    stdio: LaunchedStdio::Pipes { stdin_write, stdout_read, stderr_read },
                })
            }
            ForkResult::Child => {
                drop(stdin_write);
                drop(stdout_read);
                drop(stderr_read);
                dup_onto_std_fds(stdin_read.as_raw_fd(), stdout_write.as_raw_fd(), stderr_write.as_raw_fd());
                exec_runtime_or_bail(runtime_path, bundle_dir, container_id, None);
            }
        }
    }
}

/// Fork the runtime binary without touching this process's own stdio
/// (used for the terminal path, where stdio flows through the console
/// socket instead of inherited pipes).
fn exec_delegated_runtime(
    runtime_path: &str,
    bundle_dir: &Path,
    container_id: &str,
    console_socket: Option<&Path>,
) -> Result<Pid, AgentError> {
    match unsafe { fork() }.map_err(|e| nix_err("spawn::launch_delegated", e))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => exec_runtime_or_bail(runtime_path, bundle_dir, container_id, console_socket),
    }
}

/// Build the `<runtime> run --bundle <dir> [--console-socket <path>] <id>`
/// argument list, split out for testing without forking.
fn runtime_argv(bundle_dir: &Path, container_id: &str, console_socket: Option<&Path>) -> Vec<String> {
    let mut argv = vec!["run".to_string(), "--bundle".to_string(), bundle_dir.display().to_string()];
    if let Some(socket) = console_socket {
        argv.push("--console-socket".to_string());
        argv.push(socket.display().to_string());
    }
    argv.push(container_id.to_string());
    argv
}

fn exec_runtime_or_bail(runtime_path: &str, bundle_dir: &Path, container_id: &str, console_socket: Option<&Path>) -> ! {
    let bail = |step: &str, err: impl std::fmt::Display| -> ! {
        eprintln!("vminitd: delegated runtime exec failed at {step}: {err}");
        std::process::exit(127);
    };

    let argv = runtime_argv(bundle_dir, container_id, console_socket);

    let program = match CString::new(runtime_path) {
        Ok(c) => c,
        Err(e) => bail("argv0", e),
    };
    let args: Result<Vec<CString>, _> = std::iter::once(runtime_path.to_string())
        .chain(argv)
        .map(|a| CString::new(a))
        .collect();
    let args = match args {
        Ok(a) => a,
        Err(e) => bail("argv", e),
    };

    match execvp(&program, &args) {
        Ok(_) => unreachable!("execvp does not return on success"),
        Err(e) => bail("execvp", e),
    }
}
