//! Request verbs served by the control channel (spec §4.10): one variant per
//! handler, grouped the way the dispatcher groups them.

use serde::{Deserialize, Serialize};
use vminit_container::{ContainerSpec, ProcessSpec};
use vminit_dns::HostResolverConfig;

/// One `/etc/hosts` line, as carried on the wire (mirrors
/// `vminit_dns::hosts_file::HostsEntry`, which has no `serde` impls of its
/// own since it is only ever constructed in-process).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsEntryWire {
    pub address: String,
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Flags accepted by the whole-file write verb (spec §4.10 "Filesystem
/// utilities": "write whole files with flags {create-parent,
/// create-if-missing, append}").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileFlags {
    #[serde(default)]
    pub create_parent: bool,
    #[serde(default)]
    pub create_if_missing: bool,
    #[serde(default)]
    pub append: bool,
}

/// Which host-side vsock port (if any) backs a process's stdio stream
/// (spec §3 "Host-stdio endpoints": "up to three optional host-side port
/// numbers"). A `None` leaves the corresponding stream unconnected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStdioPorts {
    #[serde(default)]
    pub stdin: Option<u32>,
    #[serde(default)]
    pub stdout: Option<u32>,
    #[serde(default)]
    pub stderr: Option<u32>,
    #[serde(default)]
    pub terminal: bool,
}

/// A terminal size in rows/cols, as forwarded to `resize(execID, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

/// Which cgroup statistic categories a `GetStats` call asks for (spec §4.10
/// "Statistics": "selected categories {process counts, memory, cpu,
/// block-io, network, memory-events}").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatCategory {
    ProcessCount,
    Memory,
    Cpu,
    BlockIo,
    Network,
    MemoryEvents,
}

/// One addressed proxy configuration (spec §4.7 / §4.10 "Vsock proxies").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyDirectionWire {
    ListenUnixDialVsock,
    ListenVsockDialUnix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpecWire {
    pub id: String,
    pub direction: ProxyDirectionWire,
    pub port: u32,
    pub path: String,
    #[serde(default)]
    pub permissions: Option<u32>,
}

/// One request verb, the sole payload of [`crate::Frame::Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    // Time / emulation / sysctl
    SetClock { epoch_millis: i64 },
    RegisterBinfmt { registration: String },
    WriteSysctl { key: String, value: String },

    // Filesystem utilities
    Mkdir { path: String, mode: u32, create_parents: bool },
    WriteFile { path: String, mode: u32, flags: WriteFileFlags },
    CopyFileIn { path: String, mode: u32, create_parents: bool },
    CopyFileOut { path: String },
    CopyDirIn { path: String },
    CopyDirOut { path: String },

    // Mounting
    Mount { source: String, target: String, fstype: String, flags: u64, data: String },
    Unmount { target: String, force: bool },

    // Environment
    GetEnv { container_id: String, exec_id: String, name: String },
    SetEnv { container_id: String, exec_id: String, name: String, value: String },

    // Process control
    CreateContainer { spec: ContainerSpec, stdio: HostStdioPorts },
    CreateExec { container_id: String, exec_id: String, process: ProcessSpec },
    StartProcess { container_id: String, exec_id: String, stdio: HostStdioPorts },
    WaitProcess { container_id: String, exec_id: String },
    KillProcess { container_id: String, exec_id: String, signal: i32 },
    ResizeProcess { container_id: String, exec_id: String, size: WindowSize },
    CloseStdin { container_id: String, exec_id: String },
    DeleteExec { container_id: String, exec_id: String },
    DeleteContainer { container_id: String },

    // Networking
    LinkSetState { interface: String, up: bool, mtu: Option<u32> },
    AddAddress { interface: String, address: String, prefix_len: u8 },
    AddLinkRoute { interface: String, destination: String, prefix_len: u8 },
    AddDefaultRoute { gateway: String },

    // DNS / hosts
    WriteResolverConfig { root: String, config: HostResolverConfig },
    WriteHostsFile { root: String, entries: Vec<HostsEntryWire>, comment: Option<String> },

    // Statistics
    GetStats { container_ids: Vec<String>, categories: Vec<StatCategory> },

    // Vsock proxies
    StartProxy { spec: ProxySpecWire },
    StopProxy { id: String },

    // Sync / kill
    Sync,
    KillPid { pid: i32, signal: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json_with_tagged_op() {
        let req = Request::KillPid { pid: 42, signal: 9 };
        let encoded = serde_json::to_string(&req).unwrap();
        assert!(encoded.contains("\"op\":\"kill-pid\""));
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Request::KillPid { pid, signal } => {
                assert_eq!(pid, 42);
                assert_eq!(signal, 9);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn write_file_flags_default_to_false() {
        let flags: WriteFileFlags = serde_json::from_str("{}").unwrap();
        assert_eq!(flags, WriteFileFlags::default());
    }
}
