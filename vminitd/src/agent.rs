//! The long-lived agent (spec §4, §6 "Control channel"): wires every
//! subsystem together, binds the vsock control channel, and serves
//! connections until the process is killed.
//!
//! Mirrors `homeroute`'s top-level `main` shape — construct each subsystem
//! in dependency order, spawn its long-running task, then fall into the
//! accept loop — generalized from HTTP/TCP listeners to one vsock listener
//! framed with length-prefixed JSON instead.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};
use tracing::{error, info, warn};
use vminit_common::BootConfig;
use vminit_container::ContainerManager;
use vminit_dns::config::DnsMonitorConfig;
use vminit_dns::DnsMonitor;
use vminit_icmp::IcmpSocket;
use vminit_netlink::NetlinkClient;
use vminit_poller::Poller;
use vminit_proxy::ProxyRegistry;
use vminit_supervisor::Supervisor;

use crate::connection::handle_connection;
use crate::dispatcher::Dispatcher;

/// Build every subsystem, bind the control channel and serve connections
/// forever. Returns only on a fatal setup error; per-connection errors are
/// logged and dropped (spec §7: "errors are per-request; no connection-wide
/// failure shuts the agent down").
pub async fn run(config: BootConfig) -> anyhow::Result<()> {
    let supervisor = Supervisor::new();
    supervisor.spawn_reaper()?;

    let (poller, poller_handle) = Poller::new()?;
    std::thread::Builder::new().name("vminit-poller".into()).spawn(move || poller.run())?;

    let containers = Arc::new(ContainerManager::new(
        supervisor.clone(),
        poller_handle,
        PathBuf::from(&config.bundle_root),
        PathBuf::from(&config.container_cgroup_root),
    ));

    let netlink = match NetlinkClient::new() {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("netlink client unavailable, networking verbs will fail: {e}");
            None
        }
    };

    let proxies = Arc::new(ProxyRegistry::new());

    let dns = spawn_dns_monitor(&config);

    tokio::spawn(crate::memory_pressure::run(format!("{}/memory.pressure", config.cgroup_root)));

    let dispatcher = Arc::new(Dispatcher { containers, netlink, proxies, dns, config: config.clone() });

    let addr = VsockAddr::new(VMADDR_CID_ANY, config.control_port);
    let listener = VsockListener::bind(addr)
        .map_err(|e| anyhow::anyhow!("failed to bind control channel on vsock port {}: {e}", config.control_port))?;
    info!(port = config.control_port, "control channel listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("control channel accept failed: {e}");
                continue;
            }
        };
        info!(?peer, "control channel connection accepted");
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { handle_connection(stream, dispatcher).await });
    }
}

/// Start the DNS monitor's own task when a monitored interface is
/// configured, returning the handle the dispatcher registers resolver
/// files against (spec §4.4). A missing interface, or a raw-ICMPv6-socket
/// permission failure, leaves DNS handling disabled rather than fatal.
fn spawn_dns_monitor(config: &BootConfig) -> Option<Arc<DnsMonitor>> {
    if config.dns_interface.is_empty() {
        return None;
    }

    let socket = match IcmpSocket::new_v6() {
        Ok(socket) => socket,
        Err(e) => {
            warn!("failed to open ICMPv6 socket for DNS monitor: {e}");
            return None;
        }
    };

    let monitor_config = DnsMonitorConfig {
        enabled: true,
        interface: config.dns_interface.clone(),
        scope_id: config.dns_scope_id,
        ra_timeout_secs: config.dns_ra_timeout_secs,
        source_link_layer_address: None,
    };

    let monitor = Arc::new(DnsMonitor::new(monitor_config, socket));
    let task_handle = monitor.clone();
    tokio::spawn(async move { task_handle.run().await });
    Some(monitor)
}
