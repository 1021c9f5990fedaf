//! The subset of the OCI runtime spec this agent actually reads and writes
//! (spec §1: the full schema is an external collaborator; only the fields
//! the container manager touches are modeled here — effective user
//! resolution, environment, terminal/cwd, and the external-runtime switch).

use serde::{Deserialize, Serialize};

/// One process to launch, either a container's init or a later exec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: UserSpec,
}

fn default_cwd() -> String {
    "/".to_string()
}

/// Requested process owner, resolved against the rootfs's `/etc/passwd` and
/// `/etc/group` at creation time (spec §4.9 step 2, "getExecUser").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSpec {
    /// A `uid[:gid]` or bare username looked up in the rootfs passwd file.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub additional_gids: Vec<u32>,
}

/// How the init process is actually launched (spec §4.9 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuntimeMode {
    /// In-process fork/exec using the supervisor's own primitives; this
    /// manager owns cgroup cleanup.
    Native,
    /// Delegated to an external OCI runtime binary at `runtime_path`; the
    /// runtime owns its own cleanup.
    Delegated { runtime_path: String },
}

/// A container's creation spec, as the request dispatcher hands it to the
/// container manager (spec §4.9 construction steps 1-4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: String,
    pub rootfs: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub cgroup_path: Option<String>,
    pub init: ProcessSpec,
    pub runtime: RuntimeMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_spec_defaults_cwd_to_root() {
        let json = r#"{"args": ["/bin/sh"]}"#;
        let spec: ProcessSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.cwd, "/");
        assert!(!spec.terminal);
    }
}
