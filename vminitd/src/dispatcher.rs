//! Request dispatcher (spec §4.10): one method per verb group, wired to the
//! container manager, supervisor, netlink client, proxy registry and DNS
//! monitor. [`crate::connection`] calls [`Dispatcher::dispatch`] once per
//! request frame and turns the result into a `Response`/`WireError`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_vsock::{VsockAddr, VsockStream, VMADDR_CID_HOST};
use vminit_common::{AgentError, BootConfig, ErrorKind};
use vminit_container::process::HostStdio;
use vminit_container::{ContainerManager, ContainerStatsRaw, StatsWanted};
use vminit_dns::hosts_file::{render_hosts_file, write_atomic, HostsEntry};
use vminit_dns::resolver_file::{render_resolver_file, rewrite_resolver_file};
use vminit_dns::{DnsMonitor, ResolverFileState};
use vminit_netlink::NetlinkClient;
use vminit_proxy::{ProxyDirection, ProxyRegistry, ProxySpec};
use vminit_protocol::{
    ContainerStatsWire, ExitStatusWire, HostStdioPorts, HostsEntryWire, ProxyDirectionWire, ProxySpecWire, Request,
    Response, StatCategory, WindowSize, WriteFileFlags,
};

use crate::fsutil;
use crate::transfer::{ChunkReader, ChunkWriter};

/// Everything one connection's requests are served against. One instance is
/// shared (via `Arc`) across every connection the agent accepts.
pub struct Dispatcher {
    pub containers: Arc<ContainerManager>,
    pub netlink: Option<NetlinkClient>,
    pub proxies: Arc<ProxyRegistry>,
    pub dns: Option<Arc<DnsMonitor>>,
    pub config: BootConfig,
}

impl Dispatcher {
    /// Resolve up to three optional host-side vsock ports into the
    /// `OwnedFd`s a [`HostStdio`] expects (spec §3 "Host-stdio endpoints").
    async fn dial_host_stdio(&self, ports: HostStdioPorts) -> Result<HostStdio, AgentError> {
        Ok(HostStdio {
            stdin: match ports.stdin {
                Some(port) => Some(dial_host_port(port).await?),
                None => None,
            },
            stdout: match ports.stdout {
                Some(port) => Some(dial_host_port(port).await?),
                None => None,
            },
            stderr: match ports.stderr {
                Some(port) => Some(dial_host_port(port).await?),
                None => None,
            },
        })
    }

    /// Handle one request, with `reader`/`writer` available for the handful
    /// of verbs that stream chunk data (spec §4.10 "Filesystem utilities").
    pub async fn dispatch(
        &self,
        request: Request,
        reader: Option<&mut ChunkReader>,
        writer: Option<&ChunkWriter>,
    ) -> Result<Response, AgentError> {
        match request {
            // Time / emulation / sysctl
            Request::SetClock { epoch_millis } => {
                set_clock(epoch_millis)?;
                Ok(Response::Ack)
            }
            Request::RegisterBinfmt { registration } => {
                register_binfmt(&registration).await?;
                Ok(Response::Ack)
            }
            Request::WriteSysctl { key, value } => {
                write_sysctl(&key, &value).await?;
                Ok(Response::Ack)
            }

            // Filesystem utilities
            Request::Mkdir { path, mode, create_parents } => {
                fsutil::mkdir(Path::new(&path), mode, create_parents).await?;
                Ok(Response::Ack)
            }
            Request::WriteFile { path, mode, flags } => {
                let data = read_full_body(reader).await?;
                fsutil::write_file(Path::new(&path), mode, flags, &data).await?;
                Ok(Response::Ack)
            }
            Request::CopyFileIn { path, mode, create_parents } => {
                let reader = reader.ok_or_else(|| missing_stream("CopyFileIn"))?;
                crate::transfer::receive_file(Path::new(&path), mode, create_parents, reader).await?;
                Ok(Response::Ack)
            }
            Request::CopyFileOut { path } => {
                let writer = writer.ok_or_else(|| missing_stream("CopyFileOut"))?;
                let total_bytes = crate::transfer::send_file(Path::new(&path), writer).await?;
                Ok(Response::FileSize { total_bytes })
            }
            Request::CopyDirIn { path } => {
                let reader = reader.ok_or_else(|| missing_stream("CopyDirIn"))?;
                crate::transfer::receive_directory(Path::new(&path), reader).await?;
                Ok(Response::Ack)
            }
            Request::CopyDirOut { path } => {
                let writer = writer.ok_or_else(|| missing_stream("CopyDirOut"))?;
                let total_bytes = crate::transfer::send_directory(Path::new(&path), writer).await?;
                Ok(Response::FileSize { total_bytes })
            }

            // Mounting
            Request::Mount { source, target, fstype, flags, data } => {
                fsutil::mount(&source, &target, &fstype, flags, &data).await?;
                Ok(Response::Ack)
            }
            Request::Unmount { target, force } => {
                fsutil::unmount(&target, force).await?;
                Ok(Response::Ack)
            }

            // Environment
            Request::GetEnv { container_id, exec_id, name } => {
                let value = self.containers.get_env(&container_id, &exec_id, &name).await?;
                Ok(Response::EnvValue { value })
            }
            Request::SetEnv { container_id, exec_id, name, value } => {
                self.containers.set_env(&container_id, &exec_id, &name, &value).await?;
                Ok(Response::Ack)
            }

            // Process control
            Request::CreateContainer { spec, stdio } => {
                let host = self.dial_host_stdio(stdio).await?;
                self.containers.create(spec, host).await?;
                Ok(Response::Ack)
            }
            Request::CreateExec { container_id, exec_id, process } => {
                self.containers.create_exec(&container_id, &exec_id, process).await?;
                Ok(Response::Ack)
            }
            Request::StartProcess { container_id, exec_id, stdio } => {
                let host = self.dial_host_stdio(stdio).await?;
                self.containers.start(&container_id, &exec_id, host).await?;
                Ok(Response::Ack)
            }
            Request::WaitProcess { container_id, exec_id } => {
                let status = self.containers.wait(&container_id, &exec_id).await?;
                Ok(Response::ExitStatus(ExitStatusWire { code: status.code, exited_at_epoch_millis: status.when.timestamp_millis() }))
            }
            Request::KillProcess { container_id, exec_id, signal } => {
                self.containers.kill(&container_id, &exec_id, signal).await?;
                Ok(Response::Ack)
            }
            Request::ResizeProcess { container_id, exec_id, size: WindowSize { rows, cols } } => {
                self.containers.resize(&container_id, &exec_id, rows, cols).await?;
                Ok(Response::Ack)
            }
            Request::CloseStdin { container_id, exec_id } => {
                self.containers.close_stdin(&container_id, &exec_id).await?;
                Ok(Response::Ack)
            }
            Request::DeleteExec { container_id, exec_id } => {
                self.containers.delete_exec(&container_id, &exec_id).await?;
                Ok(Response::Ack)
            }
            Request::DeleteContainer { container_id } => {
                self.containers.delete(&container_id).await?;
                Ok(Response::Ack)
            }

            // Networking
            Request::LinkSetState { interface, up, mtu } => {
                self.netlink()?.set_link_state(&interface, up, mtu).await?;
                Ok(Response::Ack)
            }
            Request::AddAddress { interface, address, prefix_len } => {
                let addr = parse_ip(&address)?;
                self.netlink()?.add_address(&interface, addr, prefix_len).await?;
                Ok(Response::Ack)
            }
            Request::AddLinkRoute { interface, destination, prefix_len } => {
                let dest = parse_ip(&destination)?;
                self.netlink()?.add_link_route(&interface, dest, prefix_len).await?;
                Ok(Response::Ack)
            }
            Request::AddDefaultRoute { gateway } => {
                let gateway = parse_ip(&gateway)?;
                self.netlink()?.add_default_route(gateway).await?;
                Ok(Response::Ack)
            }

            // DNS / hosts
            Request::WriteResolverConfig { root, config } => {
                self.write_resolver_config(&root, config).await?;
                Ok(Response::Ack)
            }
            Request::WriteHostsFile { root, entries, comment } => {
                write_hosts_file(&root, entries, comment).await?;
                Ok(Response::Ack)
            }

            // Statistics
            Request::GetStats { container_ids, categories } => {
                let containers = self.stats(container_ids, &categories).await?;
                Ok(Response::Stats { containers })
            }

            // Vsock proxies
            Request::StartProxy { spec } => {
                self.proxies.start(proxy_spec_from_wire(spec)).await?;
                Ok(Response::Ack)
            }
            Request::StopProxy { id } => {
                self.proxies.stop(&id).await?;
                Ok(Response::Ack)
            }

            // Sync / kill
            Request::Sync => {
                tokio::task::spawn_blocking(nix::unistd::sync)
                    .await
                    .map_err(|e| AgentError::new(ErrorKind::Internal, "dispatcher::sync", e.to_string()))?;
                Ok(Response::Ack)
            }
            Request::KillPid { pid, signal } => {
                kill_pid(pid, signal)?;
                Ok(Response::Ack)
            }
        }
    }

    fn netlink(&self) -> Result<&NetlinkClient, AgentError> {
        self.netlink
            .as_ref()
            .ok_or_else(|| AgentError::new(ErrorKind::Unsupported, "dispatcher::netlink", "netlink client unavailable"))
    }

    async fn write_resolver_config(&self, root: &str, config: vminit_dns::HostResolverConfig) -> Result<(), AgentError> {
        let path = PathBuf::from(root).join("etc").join("resolv.conf");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| AgentError::from_errno("dispatcher::write_resolver_config", e))?;
        }
        match &self.dns {
            Some(dns) => dns.register(&path, config).await,
            None => {
                let mut state = ResolverFileState::new();
                state.update_host_config(config);
                rewrite_resolver_file(&path, &state, std::time::SystemTime::now()).await
            }
        }
    }

    async fn stats(&self, container_ids: Vec<String>, categories: &[StatCategory]) -> Result<Vec<ContainerStatsWire>, AgentError> {
        let ids = if container_ids.is_empty() { self.containers.container_ids().await } else { container_ids };
        let want = StatsWanted {
            process_count: categories.contains(&StatCategory::ProcessCount),
            memory: categories.contains(&StatCategory::Memory),
            cpu: categories.contains(&StatCategory::Cpu),
            block_io: categories.contains(&StatCategory::BlockIo),
            memory_events: categories.contains(&StatCategory::MemoryEvents),
        };
        let network = if categories.contains(&StatCategory::Network) {
            match &self.netlink {
                Some(netlink) => Some(netlink.ethernet_interface_stats().await?),
                None => None,
            }
        } else {
            None
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw = self.containers.stats(&id, want).await?;
            out.push(stats_wire(id, raw, network.clone()));
        }
        Ok(out)
    }
}

fn missing_stream(op: &str) -> AgentError {
    AgentError::new(ErrorKind::InvalidArgument, op, "request requires a chunk stream but none was attached")
}

async fn read_full_body(reader: Option<&mut ChunkReader>) -> Result<Vec<u8>, AgentError> {
    let reader = reader.ok_or_else(|| missing_stream("WriteFile"))?;
    reader.collect_all().await
}

fn parse_ip(addr: &str) -> Result<std::net::IpAddr, AgentError> {
    addr.parse().map_err(|_| AgentError::invalid_argument("dispatcher::parse_ip", format!("not an IP address: {addr}")))
}

fn stats_wire(container_id: String, raw: ContainerStatsRaw, network: Option<Vec<(String, vminit_netlink::InterfaceStats)>>) -> ContainerStatsWire {
    ContainerStatsWire {
        container_id,
        process_count: raw.process_count,
        memory_current_bytes: raw.memory_current_bytes,
        memory_stat: raw.memory_stat,
        memory_events: raw.memory_events,
        cpu_stat: raw.cpu_stat,
        io_stat_raw: raw.io_stat_raw,
        network: network.map(|entries| entries.into_iter().map(|(name, s)| (name, interface_stats_wire(s))).collect()),
    }
}

fn interface_stats_wire(s: vminit_netlink::InterfaceStats) -> vminit_protocol::InterfaceStatsWire {
    vminit_protocol::InterfaceStatsWire {
        rx_bytes: s.rx_bytes,
        tx_bytes: s.tx_bytes,
        rx_packets: s.rx_packets,
        tx_packets: s.tx_packets,
        rx_errors: s.rx_errors,
        tx_errors: s.tx_errors,
    }
}

fn proxy_spec_from_wire(spec: ProxySpecWire) -> ProxySpec {
    ProxySpec {
        id: spec.id,
        direction: match spec.direction {
            ProxyDirectionWire::ListenUnixDialVsock => ProxyDirection::ListenUnixDialVsock,
            ProxyDirectionWire::ListenVsockDialUnix => ProxyDirection::ListenVsockDialUnix,
        },
        port: spec.port,
        path: PathBuf::from(spec.path),
        permissions: spec.permissions,
    }
}

async fn write_hosts_file(root: &str, entries: Vec<HostsEntryWire>, comment: Option<String>) -> Result<(), AgentError> {
    let path = PathBuf::from(root).join("etc").join("hosts");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| AgentError::from_errno("dispatcher::write_hosts_file", e))?;
    }
    let entries: Vec<HostsEntry> = entries
        .into_iter()
        .map(|e| HostsEntry { address: e.address, hostnames: e.hostnames, comment: e.comment })
        .collect();
    let body = render_hosts_file(&entries, comment.as_deref())?;
    write_atomic(&path, &body).await
}

/// `epoch_millis` → `clock_settime(CLOCK_REALTIME, ...)` (spec §4.10 "Set the
/// system clock").
fn set_clock(epoch_millis: i64) -> Result<(), AgentError> {
    let secs = epoch_millis.div_euclid(1000);
    let nanos = epoch_millis.rem_euclid(1000) * 1_000_000;
    let ts = nix::sys::time::TimeSpec::new(secs, nanos);
    nix::time::clock_settime(nix::time::ClockId::CLOCK_REALTIME, ts)
        .map_err(|e| AgentError::from_errno("dispatcher::set_clock", std::io::Error::from_raw_os_error(e as i32)))
}

/// Write `registration` to `/proc/sys/fs/binfmt_misc/register` (spec §4.10
/// "register a binary-format handler").
async fn register_binfmt(registration: &str) -> Result<(), AgentError> {
    tokio::fs::write("/proc/sys/fs/binfmt_misc/register", registration)
        .await
        .map_err(|e| AgentError::from_errno("dispatcher::register_binfmt", e))
}

/// Write one `/proc/sys/*` entry; dots in `key` become path separators
/// (spec §4.10: "write `/proc/sys/*` entries (dots in keys become path
/// separators)").
async fn write_sysctl(key: &str, value: &str) -> Result<(), AgentError> {
    let relative = key.replace('.', "/");
    let path = Path::new("/proc/sys").join(relative);
    tokio::fs::write(&path, value).await.map_err(|e| AgentError::from_errno("dispatcher::write_sysctl", e))
}

fn kill_pid(pid: i32, signal: i32) -> Result<(), AgentError> {
    let signal = nix::sys::signal::Signal::try_from(signal)
        .map_err(|e| AgentError::new(ErrorKind::InvalidArgument, "dispatcher::kill_pid", e.to_string()))?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal)
        .map_err(|e| AgentError::from_errno("dispatcher::kill_pid", std::io::Error::from_raw_os_error(e as i32)))
}

/// Dial the host over vsock on `port`, handing back an owned duplicate of
/// the connected fd: the `VsockStream` wrapper is dropped immediately after,
/// since [`HostStdio`] only wants the raw descriptor for the I/O relay to
/// take over.
async fn dial_host_port(port: u32) -> Result<OwnedFd, AgentError> {
    let stream = VsockStream::connect(VsockAddr::new(VMADDR_CID_HOST, port))
        .await
        .map_err(|e| AgentError::from_errno("dispatcher::dial_host_port", e))?;
    let dup = nix::unistd::dup(stream.as_raw_fd())
        .map_err(|e| AgentError::from_errno("dispatcher::dial_host_port", std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysctl_key_dots_become_path_separators() {
        let relative = "net.ipv4.ip_forward".replace('.', "/");
        assert_eq!(relative, "net/ipv4/ip_forward");
    }

    #[test]
    fn parse_ip_rejects_garbage() {
        let err = parse_ip("not-an-ip").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn set_clock_splits_millis_into_secs_and_nanos() {
        let secs = 1_700_000_005i64.div_euclid(1000);
        let nanos = 1_700_000_005i64.rem_euclid(1000) * 1_000_000;
        assert_eq!(secs, 1_700_000);
        assert_eq!(nanos, 5_000_000);
    }
}
