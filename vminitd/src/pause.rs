//! The `pause` subcommand (spec §6 "CLI surface"): a minimal PID-namespace
//! reaper, used as the init of a paused (no workload) container. Installs
//! SIGINT/SIGTERM handlers that exit 0, reaps SIGCHLD until none remain,
//! then blocks on `pause()` forever.

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::warn;

extern "C" fn exit_zero(_: libc::c_int) {
    std::process::exit(0);
}

extern "C" fn reap(_: libc::c_int) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    if nix::unistd::getpid() != Pid::from_raw(1) {
        warn!("pause subcommand invoked as non-PID-1 process; signal behavior may differ");
    }

    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(exit_zero))?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(exit_zero))?;
        signal::signal(Signal::SIGCHLD, SigHandler::Handler(reap))?;
    }

    loop {
        nix::unistd::pause();
    }
}
