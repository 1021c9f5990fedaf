//! Leaf cgroup v2 node management (spec §3 "Cgroup", §4.9 step 3, §6 "Boot
//! filesystem layout"). One node per container plus one for the agent
//! itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::debug;
use vminit_common::{retry::retry_on, AgentError};

const DELETE_RETRY_ATTEMPTS: u32 = 5;
const DELETE_RETRY_BASE: Duration = Duration::from_millis(10);

/// A leaf cgroup v2 node at `path` (an absolute path under
/// `/sys/fs/cgroup`).
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create this node if it does not already exist.
    pub async fn create(&self) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::create", e))
    }

    /// Enable every controller listed in this node's `cgroup.controllers`
    /// on its own `cgroup.subtree_control`, so children created under it
    /// inherit them (spec §3: "all available controllers on the parent are
    /// enabled before a child is created").
    pub async fn enable_all_controllers(&self) -> Result<(), AgentError> {
        let available = tokio::fs::read_to_string(self.path.join("cgroup.controllers"))
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::enable_all_controllers", e))?;
        let directive: String = available
            .split_whitespace()
            .map(|name| format!("+{name}"))
            .collect::<Vec<_>>()
            .join(" ");
        if directive.is_empty() {
            return Ok(());
        }
        tokio::fs::write(self.path.join("cgroup.subtree_control"), directive)
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::enable_all_controllers", e))
    }

    /// Enroll `pid` into this node (spec §3: "every container PID is
    /// enrolled before it becomes observable to the supervisor").
    pub async fn add_pid(&self, pid: Pid) -> Result<(), AgentError> {
        tokio::fs::write(self.path.join("cgroup.procs"), pid.as_raw().to_string())
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::add_pid", e))
    }

    /// Set `memory.high` in bytes (spec §6: "agent's own memory.high is set
    /// at boot", to 75 MiB).
    pub async fn set_memory_high(&self, bytes: u64) -> Result<(), AgentError> {
        tokio::fs::write(self.path.join("memory.high"), bytes.to_string())
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::set_memory_high", e))
    }

    /// Delete this node, retrying on EBUSY/EAGAIN with bounded exponential
    /// backoff (spec §4.9 `delete`: "base 10 ms, x2, up to 5 attempts").
    pub async fn delete(&self) -> Result<(), AgentError> {
        if !self.path.exists() {
            return Ok(());
        }
        let path = self.path.clone();
        retry_on(
            DELETE_RETRY_ATTEMPTS,
            DELETE_RETRY_BASE,
            || {
                let path = path.clone();
                async move { tokio::fs::remove_dir(&path).await }
            },
            |e| matches!(e.raw_os_error(), Some(code) if code == Errno::EBUSY as i32 || code == Errno::EAGAIN as i32),
        )
        .await
        .map_err(|e| AgentError::from_errno("Cgroup::delete", e))
    }

    async fn read_u64(&self, file: &str) -> Result<u64, AgentError> {
        let raw = tokio::fs::read_to_string(self.path.join(file))
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::read_stat", e))?;
        raw.trim()
            .parse()
            .map_err(|_| AgentError::from_errno("Cgroup::read_stat", std::io::Error::from(std::io::ErrorKind::InvalidData)))
    }

    /// Parse a flat `key value\n...` file (`cpu.stat`, `memory.stat`,
    /// `memory.events`, `io.stat` share this shape; `io.stat` lines are
    /// prefixed by a device major:minor and are left to the caller to
    /// further split).
    async fn read_flat_stats(&self, file: &str) -> Result<Vec<(String, String)>, AgentError> {
        let raw = tokio::fs::read_to_string(self.path.join(file))
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::read_stat", e))?;
        Ok(raw
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let key = parts.next()?.to_string();
                let value = parts.next()?.to_string();
                Some((key, value))
            })
            .collect())
    }

    /// Current process count observed via `cgroup.procs` line count
    /// (supplements §4.10 Statistics "process counts").
    pub async fn process_count(&self) -> Result<usize, AgentError> {
        let raw = tokio::fs::read_to_string(self.path.join("cgroup.procs"))
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::process_count", e))?;
        Ok(raw.lines().filter(|l| !l.trim().is_empty()).count())
    }

    pub async fn memory_current(&self) -> Result<u64, AgentError> {
        self.read_u64("memory.current").await
    }

    pub async fn memory_stat(&self) -> Result<Vec<(String, String)>, AgentError> {
        self.read_flat_stats("memory.stat").await
    }

    pub async fn memory_events(&self) -> Result<Vec<(String, String)>, AgentError> {
        self.read_flat_stats("memory.events").await
    }

    pub async fn cpu_stat(&self) -> Result<Vec<(String, String)>, AgentError> {
        self.read_flat_stats("cpu.stat").await
    }

    pub async fn io_stat_raw(&self) -> Result<String, AgentError> {
        tokio::fs::read_to_string(self.path.join("io.stat"))
            .await
            .map_err(|e| AgentError::from_errno("Cgroup::io_stat", e))
    }

    /// Enroll self into the agent's own cgroup at boot and set its
    /// memory.high (spec §6 "Create `/vminitd` cgroup, enable all
    /// controllers, set memory.high to 75 MiB, enroll self").
    pub async fn enroll_self(&self, memory_high_bytes: u64) -> Result<(), AgentError> {
        self.create().await?;
        self.enable_all_controllers().await?;
        self.set_memory_high(memory_high_bytes).await?;
        self.add_pid(Pid::this()).await?;
        debug!(path = %self.path.display(), "agent cgroup enrolled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::at(dir.path().join("leaf"));
        cgroup.create().await.unwrap();
        assert!(cgroup.path().is_dir());
        cgroup.delete().await.unwrap();
        assert!(!cgroup.path().exists());
    }

    #[tokio::test]
    async fn delete_on_missing_path_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::at(dir.path().join("never-created"));
        cgroup.delete().await.unwrap();
    }

    #[tokio::test]
    async fn enable_all_controllers_copies_available_into_subtree_control() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::at(dir.path());
        tokio::fs::write(dir.path().join("cgroup.controllers"), "cpu memory io\n").await.unwrap();
        tokio::fs::write(dir.path().join("cgroup.subtree_control"), "").await.unwrap();
        cgroup.enable_all_controllers().await.unwrap();
        let written = tokio::fs::read_to_string(dir.path().join("cgroup.subtree_control")).await.unwrap();
        assert_eq!(written, "+cpu +memory +io");
    }

    #[tokio::test]
    async fn memory_stat_parses_flat_key_value_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::at(dir.path());
        tokio::fs::write(dir.path().join("memory.stat"), "anon 1024\nfile 2048\n").await.unwrap();
        let stats = cgroup.memory_stat().await.unwrap();
        assert_eq!(stats, vec![("anon".to_string(), "1024".to_string()), ("file".to_string(), "2048".to_string())]);
    }
}
