//! Guest-side resolver management: learns DNS servers from IPv6 router
//! advertisements and keeps `/etc/resolv.conf`-style files in sync with
//! them (spec §4.4, §6).

pub mod config;
pub mod hosts_file;
pub mod monitor;
pub mod resolver_file;
pub mod resolver_state;

pub use config::{DnsMonitorConfig, HostResolverConfig};
pub use monitor::DnsMonitor;
pub use resolver_state::{LearnedNameserver, ResolverFileState};
