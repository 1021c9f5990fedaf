use serde::{Deserialize, Serialize};

/// Configuration for one resolver-file path registration (spec §4.4 step 4,
/// §6 "Update registration is idempotent").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostResolverConfig {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub search: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Default for HostResolverConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

/// Configuration for the DNS monitor loop (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsMonitorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interface: String,
    #[serde(default = "default_scope_id")]
    pub scope_id: u32,
    #[serde(default = "default_ra_timeout_secs")]
    pub ra_timeout_secs: u64,
    #[serde(default)]
    pub source_link_layer_address: Option<[u8; 6]>,
}

fn default_scope_id() -> u32 {
    0
}
fn default_ra_timeout_secs() -> u64 {
    4
}

impl Default for DnsMonitorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_resolver_config_defaults_to_empty() {
        let config = HostResolverConfig::default();
        assert!(config.nameservers.is_empty());
        assert!(config.domain.is_none());
    }

    #[test]
    fn monitor_config_round_trips_through_json() {
        let json = r#"{"enabled": true, "interface": "eth0"}"#;
        let config: DnsMonitorConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.ra_timeout_secs, 4);
    }
}
