//! CLI entry point (spec §6 "CLI surface"): selects between `agent`, `init`
//! and `pause` based on argument parsing, with a busybox-style shortcut
//! when invoked as `.cz-init`.

mod agent;
mod boot;
mod connection;
mod dispatcher;
mod fsutil;
mod memory_pressure;
mod pause;
mod transfer;

use std::ffi::CString;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vminit_common::{logging, BootConfig};

const ARGV0_INIT_SHORTCUT: &str = ".cz-init";

#[derive(Parser)]
#[command(name = "vminitd", about = "In-guest init/agent daemon")]
struct Cli {
    /// One of trace/debug/info/notice/warning/error/critical; anything else
    /// falls back to info.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Optional TOML boot configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-lived request-dispatcher agent.
    Agent,
    /// Run the early-boot sequence, then hand off to the agent.
    Init,
    /// Minimal PID-namespace reaper used inside a paused container.
    Pause,
}

fn main() -> anyhow::Result<()> {
    let argv0 = std::env::args().next().unwrap_or_default();
    let argv0_name = std::path::Path::new(&argv0).file_name().and_then(|n| n.to_str()).unwrap_or("");

    let cli = Cli::parse();
    logging::init_tracing(&cli.log_level);

    let command = if argv0_name == ARGV0_INIT_SHORTCUT {
        Command::Init
    } else {
        cli.command.unwrap_or(Command::Agent)
    };

    maybe_reexec_foreground(&command)?;

    let config = load_boot_config(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match command {
        Command::Agent => runtime.block_on(agent::run(config)),
        Command::Init => runtime.block_on(async {
            boot::run_boot_sequence(&config).await?;
            agent::run(config).await
        }),
        Command::Pause => pause::run(),
    }
}

fn load_boot_config(path: Option<&std::path::Path>) -> anyhow::Result<BootConfig> {
    match path {
        Some(path) if path.exists() => {
            let text = std::fs::read_to_string(path)?;
            Ok(BootConfig::from_toml_str(&text)?)
        }
        _ => Ok(BootConfig::default()),
    }
}

/// Debug-only re-exec under a child process so early-boot log lines survive
/// a guest panic in the real init/agent work (spec §6 env vars:
/// `FOREGROUND`). Set `FOREGROUND=1` to skip this and run directly, which is
/// what the re-exec'd child itself does.
fn maybe_reexec_foreground(command: &Command) -> anyhow::Result<()> {
    if !cfg!(debug_assertions) {
        return Ok(());
    }
    if std::env::var_os("FOREGROUND").is_some() {
        return Ok(());
    }
    if matches!(command, Command::Pause) {
        return Ok(());
    }

    tracing::info!("FOREGROUND unset, re-executing under a log-preserving parent");

    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    match unsafe { fork() }.map_err(|e| anyhow::anyhow!("fork failed: {e}"))? {
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).map_err(|e| anyhow::anyhow!("waitpid failed: {e}"))?;
            match status {
                WaitStatus::Exited(_, code) => std::process::exit(code),
                WaitStatus::Signaled(_, signal, _) => {
                    tracing::error!(?signal, "child exited due to signal");
                    std::process::exit(128 + signal as i32)
                }
                other => {
                    tracing::warn!(?other, "unexpected wait status for re-exec'd child");
                    std::process::exit(1)
                }
            }
        }
        ForkResult::Child => {
            std::env::set_var("FOREGROUND", "1");
            if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
                tracing::warn!(%e, "failed to set child subreaper, orphans may be reparented past us");
            }
            let argv: Vec<CString> = std::env::args().map(|a| CString::new(a).expect("argv has no NUL bytes")).collect();
            let argv0 = argv.first().cloned().unwrap_or_else(|| CString::new("vminitd").unwrap());
            nix::unistd::execvp(&argv0, &argv).map_err(|e| anyhow::anyhow!("execvp failed: {e}"))?;
            unreachable!("execvp only returns on error")
        }
    }
}
