//! Early boot sequence (spec §6 "Boot filesystem layout"): mount the
//! pseudo-filesystems init needs, then create and enroll the agent's own
//! cgroup. Mirrors the mount-then-tune shape of the reference `vinit`
//! startup routine (`mount_pseudo_fs`/`apply_perf_tuning_early`), trimmed to
//! the mounts this spec actually names.
//!
//! Failure to mount `/proc` or to create the self cgroup is fatal (spec §7):
//! callers propagate the error up to `main`, which logs and exits non-zero.

use std::path::Path;

use nix::mount::{mount, MsFlags};
use tracing::info;
use vminit_common::{AgentError, BootConfig, ErrorKind};
use vminit_container::Cgroup;

const SECURE_FLAGS: MsFlags = MsFlags::from_bits_truncate(
    MsFlags::MS_NOEXEC.bits() | MsFlags::MS_NOSUID.bits() | MsFlags::MS_NODEV.bits() | MsFlags::MS_RELATIME.bits(),
);

fn mount_fs(source: &str, target: &str, fstype: &str, flags: MsFlags, data: Option<&str>) -> Result<(), AgentError> {
    std::fs::create_dir_all(target).map_err(|e| AgentError::from_errno("boot::mount_fs", e))?;
    mount(Some(source), target, Some(fstype), flags, data)
        .map_err(|e| AgentError::new(ErrorKind::Internal, "boot::mount_fs", format!("mount {target} ({fstype}) failed: {e}")))?;
    info!(target, fstype, "mounted");
    Ok(())
}

/// Mount `/proc`, `/run`, `/sys`, `/sys/fs/cgroup` and the binary-format
/// mount point, in order, then create and enroll the agent's cgroup (spec
/// §6: "Mount on startup, in order... Create `/vminitd` cgroup, enable all
/// controllers, set memory.high to 75 MiB, enroll self").
pub async fn run_boot_sequence(config: &BootConfig) -> Result<(), AgentError> {
    if !Path::new("/proc/self").exists() {
        mount_fs("proc", "/proc", "proc", SECURE_FLAGS, None)?;
    }
    mount_fs("tmpfs", "/run", "tmpfs", SECURE_FLAGS, Some("mode=0755"))?;
    mount_fs("sysfs", "/sys", "sysfs", SECURE_FLAGS, None)?;
    mount_fs("cgroup", "/sys/fs/cgroup", "cgroup2", SECURE_FLAGS, Some("nsdelegate"))?;
    mount_fs("binfmt_misc", "/proc/sys/fs/binfmt_misc", "binfmt_misc", SECURE_FLAGS, None)?;

    let self_cgroup = Cgroup::at(&config.cgroup_root);
    self_cgroup.create().await?;
    self_cgroup.enable_all_controllers().await?;
    self_cgroup.enroll_self(config.agent_memory_high_bytes).await?;
    info!(
        cgroup_root = %config.cgroup_root,
        memory_high_bytes = config.agent_memory_high_bytes,
        "enrolled self into agent cgroup"
    );

    Ok(())
}
