//! Networking verbs (spec §4.10 "Networking", "Statistics"): bring an
//! interface up/down with optional MTU, add an address, add a link-scoped or
//! default route, and collect per-interface network statistics.
//!
//! Built over `rtnetlink`/`netlink-packet-route` the way
//! `connlib-tunnel`'s `device_channel::tun_linux` drives the same crates:
//! one connection, `handle.link()/.address()/.route()` builders, `execute()`
//! awaited per call.

use std::net::IpAddr;
use std::path::Path;

use futures_util::TryStreamExt;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use netlink_packet_route::rtnl::RT_SCOPE_LINK;
use rtnetlink::Handle;
use tokio::task::JoinHandle;
use tracing::debug;
use vminit_common::{AgentError, ErrorKind};

/// A connected netlink client. One per agent; every verb borrows the same
/// handle, which is cheaply cloneable and safe to call concurrently.
pub struct NetlinkClient {
    handle: Handle,
    connection: JoinHandle<()>,
}

impl Drop for NetlinkClient {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

/// Selected per-interface counters from `rtnl_link_stats64` (spec §4.10
/// Statistics "network").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

impl NetlinkClient {
    pub fn new() -> Result<Self, AgentError> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| AgentError::from_errno("NetlinkClient::new", e))?;
        let connection = tokio::spawn(connection);
        Ok(Self { handle, connection })
    }

    async fn link_index(&self, name: &str) -> Result<u32, AgentError> {
        self.handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await
            .map_err(|e| netlink_err("NetlinkClient::link_index", e))?
            .map(|link| link.header.index)
            .ok_or_else(|| AgentError::not_found("NetlinkClient::link_index", format!("no interface named {name}")))
    }

    /// Bring `name` up (or down), optionally setting its MTU first (spec
    /// §4.10: "Bring an interface up/down with optional MTU").
    pub async fn set_link_state(&self, name: &str, up: bool, mtu: Option<u32>) -> Result<(), AgentError> {
        let index = self.link_index(name).await?;
        let mut request = self.handle.link().set(index);
        if let Some(mtu) = mtu {
            request = request.mtu(mtu);
        }
        let request = if up { request.up() } else { request.down() };
        request.execute().await.map_err(|e| netlink_err("NetlinkClient::set_link_state", e))
    }

    /// Add an address with prefix length `prefix_len` to `name` (spec
    /// §4.10: "add an IPv4 address").
    pub async fn add_address(&self, name: &str, addr: IpAddr, prefix_len: u8) -> Result<(), AgentError> {
        let index = self.link_index(name).await?;
        self.handle
            .address()
            .add(index, addr, prefix_len)
            .execute()
            .await
            .map_err(|e| netlink_err("NetlinkClient::add_address", e))
    }

    /// Add a route scoped to `name`'s link, with no gateway (spec §4.10:
    /// "add a link-scoped route").
    pub async fn add_link_route(&self, name: &str, destination: IpAddr, prefix_len: u8) -> Result<(), AgentError> {
        let index = self.link_index(name).await?;
        let request = self.handle.route().add().output_interface(index).scope(RT_SCOPE_LINK);
        let result = match destination {
            IpAddr::V4(dest) => request.v4().destination_prefix(dest, prefix_len).execute().await,
            IpAddr::V6(dest) => request.v6().destination_prefix(dest, prefix_len).execute().await,
        };
        result.map_err(|e| netlink_err("NetlinkClient::add_link_route", e))
    }

    /// Add a default route via `gateway` (spec §4.10: "add a default
    /// route").
    pub async fn add_default_route(&self, gateway: IpAddr) -> Result<(), AgentError> {
        let request = self.handle.route().add();
        let result = match gateway {
            IpAddr::V4(addr) => request.v4().gateway(addr).execute().await,
            IpAddr::V6(addr) => request.v6().gateway(addr).execute().await,
        };
        result.map_err(|e| netlink_err("NetlinkClient::add_default_route", e))
    }

    /// Read `rtnl_link_stats64` for `name` via a netlink link query.
    pub async fn interface_stats(&self, name: &str) -> Result<InterfaceStats, AgentError> {
        let link = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await
            .map_err(|e| netlink_err("NetlinkClient::interface_stats", e))?
            .ok_or_else(|| AgentError::not_found("NetlinkClient::interface_stats", format!("no interface named {name}")))?;

        let mut stats = InterfaceStats::default();
        for nla in &link.nlas {
            if let LinkNla::Stats64(s) = nla {
                stats = InterfaceStats {
                    rx_bytes: s.rx_bytes,
                    tx_bytes: s.tx_bytes,
                    rx_packets: s.rx_packets,
                    tx_packets: s.tx_packets,
                    rx_errors: s.rx_errors,
                    tx_errors: s.tx_errors,
                };
            }
        }
        Ok(stats)
    }

    /// Collect statistics for every `eth*` interface under `/sys/class/net`
    /// (spec §4.10 Statistics: "Network statistics are collected by
    /// enumerating `/sys/class/net` entries matching `eth*` and querying
    /// each via netlink").
    pub async fn ethernet_interface_stats(&self) -> Result<Vec<(String, InterfaceStats)>, AgentError> {
        let mut results = Vec::new();
        for name in list_ethernet_interfaces("/sys/class/net").await? {
            match self.interface_stats(&name).await {
                Ok(stats) => results.push((name, stats)),
                Err(e) => debug!(%name, error = %e, "skipping interface with unreadable statistics"),
            }
        }
        Ok(results)
    }
}

async fn list_ethernet_interfaces(sys_class_net: impl AsRef<Path>) -> Result<Vec<String>, AgentError> {
    let mut entries = tokio::fs::read_dir(sys_class_net.as_ref())
        .await
        .map_err(|e| AgentError::from_errno("list_ethernet_interfaces", e))?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| AgentError::from_errno("list_ethernet_interfaces", e))? {
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with("eth") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn netlink_err(op: &str, err: rtnetlink::Error) -> AgentError {
    AgentError::new(ErrorKind::Internal, op, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_ethernet_interfaces_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["eth0", "eth1", "lo", "wlan0"] {
            tokio::fs::create_dir(dir.path().join(name)).await.unwrap();
        }
        let mut names = list_ethernet_interfaces(dir.path()).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["eth0".to_string(), "eth1".to_string()]);
    }
}
