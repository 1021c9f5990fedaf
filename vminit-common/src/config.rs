use serde::{Deserialize, Serialize};

/// Boot-time configuration for the `vminitd` agent. Loaded from an optional
/// TOML file baked into the rootfs; every field has a sensible default so a
/// missing file is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: String,
    #[serde(default = "default_agent_memory_high_bytes")]
    pub agent_memory_high_bytes: u64,
    #[serde(default = "default_container_cgroup_root")]
    pub container_cgroup_root: String,
    #[serde(default = "default_bundle_root")]
    pub bundle_root: String,
    #[serde(default = "default_control_port")]
    pub control_port: u32,
    /// Interface to run the DNS monitor's router-solicitation cycle against
    /// (spec §4.4); the monitor stays dormant until a non-empty name is
    /// configured.
    #[serde(default)]
    pub dns_interface: String,
    #[serde(default = "default_dns_scope_id")]
    pub dns_scope_id: u32,
    #[serde(default = "default_dns_ra_timeout_secs")]
    pub dns_ra_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_cgroup_root() -> String {
    "/sys/fs/cgroup/vminitd".to_string()
}
fn default_agent_memory_high_bytes() -> u64 {
    75 * 1024 * 1024 // 75 MiB, per §6
}
fn default_container_cgroup_root() -> String {
    "/sys/fs/cgroup/container".to_string()
}
fn default_bundle_root() -> String {
    "/run/container".to_string()
}
fn default_control_port() -> u32 {
    1024
}
fn default_dns_scope_id() -> u32 {
    0
}
fn default_dns_ra_timeout_secs() -> u64 {
    4
}

impl Default for BootConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl BootConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn bundle_path(&self, container_id: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.bundle_root).join(container_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_boot_invariants() {
        let config = BootConfig::default();
        assert_eq!(config.agent_memory_high_bytes, 75 * 1024 * 1024);
        assert_eq!(config.control_port, 1024);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = BootConfig::from_toml_str("log_level = \"debug\"\n").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.control_port, 1024);
    }

    #[test]
    fn bundle_path_is_deterministic_from_id() {
        let config = BootConfig::default();
        assert_eq!(
            config.bundle_path("abc123"),
            std::path::PathBuf::from("/run/container/abc123")
        );
    }
}
