//! The container manager (spec §4.9): the single entry point the request
//! dispatcher calls into for every container/exec verb. Owns bundles,
//! cgroups, and managed processes; exposes the `ContainerProcess` capability
//! set from spec §9 as plain methods on [`ManagedExec`] reached through here.
//!
//! One init process per container, its id always equal to the container id
//! (spec §3 "Container"); `deleteExec` on that id tears down the whole
//! container (spec §4.9 `deleteExec` invariant).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use vminit_common::{AgentError, ErrorKind};
use vminit_poller::PollerHandle;
use vminit_supervisor::{ExitStatus, ProcessKind, Supervisor};

use crate::bundle::Bundle;
use crate::cgroup::Cgroup;
use crate::exec_user;
use crate::process::{HostStdio, ManagedExec};
use crate::spawn;
use crate::spec::{ContainerSpec, ProcessSpec, RuntimeMode};

/// Which cgroup statistic categories to read back (spec §4.10 "Statistics":
/// "selected categories {process counts, memory, cpu, block-io, network,
/// memory-events}"). `network` is handled by the caller, which has the
/// netlink client this crate deliberately does not depend on.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsWanted {
    pub process_count: bool,
    pub memory: bool,
    pub cpu: bool,
    pub block_io: bool,
    pub memory_events: bool,
}

/// Raw cgroup readings for one container, still in this crate's plain
/// types rather than the wire format (spec §4.10 "Statistics"); the
/// dispatcher owns translating this into [`vminit_protocol::ContainerStatsWire`].
#[derive(Debug, Clone, Default)]
pub struct ContainerStatsRaw {
    pub process_count: Option<usize>,
    pub memory_current_bytes: Option<u64>,
    pub memory_stat: Option<Vec<(String, String)>>,
    pub memory_events: Option<Vec<(String, String)>>,
    pub cpu_stat: Option<Vec<(String, String)>>,
    pub io_stat_raw: Option<String>,
}

struct ContainerEntry {
    bundle: Bundle,
    cgroup: Cgroup,
    rootfs: PathBuf,
    hostname: Option<String>,
    runtime: RuntimeMode,
    execs: HashMap<String, Arc<ManagedExec>>,
}

/// Construction parameters and runtime state for every container this agent
/// has created; indexed by container id.
pub struct ContainerManager {
    supervisor: Arc<Supervisor>,
    poller: PollerHandle,
    bundle_root: PathBuf,
    cgroup_root: PathBuf,
    containers: Mutex<HashMap<String, ContainerEntry>>,
}

impl ContainerManager {
    pub fn new(supervisor: Arc<Supervisor>, poller: PollerHandle, bundle_root: PathBuf, cgroup_root: PathBuf) -> Self {
        Self {
            supervisor,
            poller,
            bundle_root,
            cgroup_root,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Construct and start a container's init process (spec §4.9 steps
    /// 1-4): materialize the bundle, stamp `/etc/hostname`, resolve the
    /// effective user, create and enable the leaf cgroup, then launch
    /// natively or delegate to an external OCI runtime.
    pub async fn create(&self, spec: ContainerSpec, host: HostStdio) -> Result<(), AgentError> {
        let id = spec.id.clone();
        {
            let containers = self.containers.lock().await;
            if containers.contains_key(&id) {
                return Err(AgentError::already_exists("ContainerManager::create", format!("container {id} already exists")));
            }
        }

        let bundle = Bundle::create(&self.bundle_root, &id, &spec.init).await?;
        let rootfs = PathBuf::from(&spec.rootfs);
        Bundle::ensure_hostname(&rootfs, spec.hostname.as_deref()).await?;

        let cgroup_path = spec.cgroup_path.clone().map(PathBuf::from).unwrap_or_else(|| self.cgroup_root.join(&id));
        let cgroup = Cgroup::at(cgroup_path);
        cgroup.create().await?;
        cgroup.enable_all_controllers().await?;

        let launched = match &spec.runtime {
            RuntimeMode::Native => {
                let user = exec_user::resolve(&rootfs, &spec.init.user).await?;
                spawn::launch(&spec.rootfs, spec.hostname.as_deref(), &spec.init, &user)?
            }
            RuntimeMode::Delegated { runtime_path } => {
                let console_socket = bundle.root().join("console.sock");
                spawn::launch_delegated(
                    runtime_path,
                    bundle.root(),
                    &id,
                    &spec.init,
                    spec.init.terminal.then_some(console_socket.as_path()),
                )
                .await?
            }
        };

        let pid = launched.pid;
        let managed_exec = match ManagedExec::from_native_launch(id.clone(), id.clone(), ProcessKind::Init, self.poller.clone(), launched, host) {
            Ok(exec) => exec,
            Err(e) => {
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
                return Err(e);
            }
        };

        // Enroll in the cgroup before the supervisor can observe (and
        // reap) this pid (spec §3 Cgroup invariant: "every container PID
        // is enrolled before it becomes observable to the supervisor").
        if let Err(e) = cgroup.add_pid(pid).await {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            return Err(e);
        }
        if let Err(e) = self.supervisor.start(managed_exec.managed().clone(), pid) {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            return Err(e);
        }

        let mut execs = HashMap::new();
        execs.insert(id.clone(), Arc::new(managed_exec));
        let entry = ContainerEntry {
            bundle,
            cgroup,
            rootfs,
            hostname: spec.hostname,
            runtime: spec.runtime,
            execs,
        };
        self.containers.lock().await.insert(id, entry);
        Ok(())
    }

    /// Register a later exec's process spec without starting it yet (spec
    /// §4.9 `createExec`). The exec id must differ from its container's id,
    /// since that id is reserved for the init process.
    pub async fn create_exec(&self, container_id: &str, exec_id: &str, process: ProcessSpec) -> Result<(), AgentError> {
        if exec_id == container_id {
            return Err(AgentError::invalid_argument(
                "ContainerManager::create_exec",
                "exec id must differ from its container's id",
            ));
        }
        let containers = self.containers.lock().await;
        let entry = self.find(&containers, container_id)?;
        if entry.execs.contains_key(exec_id) {
            return Err(AgentError::already_exists("ContainerManager::create_exec", format!("exec {exec_id} already started")));
        }
        entry.bundle.write_exec_spec(exec_id, &process).await
    }

    /// Launch a previously-created exec (spec §4.9 `start`). The container's
    /// own init process is started as part of `create` and cannot be
    /// started again through this path.
    pub async fn start(&self, container_id: &str, exec_id: &str, host: HostStdio) -> Result<(), AgentError> {
        if exec_id == container_id {
            return Err(AgentError::invalid_state("ContainerManager::start", "init process is started at creation"));
        }

        let mut containers = self.containers.lock().await;
        let entry = self.find_mut(&mut containers, container_id)?;
        if entry.execs.contains_key(exec_id) {
            return Err(AgentError::already_exists("ContainerManager::start", format!("exec {exec_id} already started")));
        }
        let process = entry.bundle.read_exec_spec(exec_id)?;

        let launched = match &entry.runtime {
            RuntimeMode::Native => {
                let user = exec_user::resolve(&entry.rootfs, &process.user).await?;
                spawn::launch(entry.rootfs.to_str().unwrap_or("/"), entry.hostname.as_deref(), &process, &user)?
            }
            RuntimeMode::Delegated { runtime_path } => {
                let console_socket = entry.bundle.root().join("execs").join(exec_id).join("console.sock");
                spawn::launch_delegated(
                    runtime_path,
                    entry.bundle.root(),
                    exec_id,
                    &process,
                    process.terminal.then_some(console_socket.as_path()),
                )
                .await?
            }
        };

        let pid = launched.pid;
        let managed_exec = match ManagedExec::from_native_launch(exec_id, container_id, ProcessKind::Exec, self.poller.clone(), launched, host) {
            Ok(exec) => exec,
            Err(e) => {
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
                return Err(e);
            }
        };
        // Same ordering as `create`: enroll before the pid is observable
        // to the supervisor (spec §3 Cgroup invariant).
        if let Err(e) = entry.cgroup.add_pid(pid).await {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            return Err(e);
        }
        if let Err(e) = self.supervisor.start(managed_exec.managed().clone(), pid) {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            return Err(e);
        }
        entry.execs.insert(exec_id.to_string(), Arc::new(managed_exec));
        Ok(())
    }

    pub async fn wait(&self, container_id: &str, exec_id: &str) -> Result<ExitStatus, AgentError> {
        let exec = self.running_exec(container_id, exec_id).await?;
        Ok(exec.wait().await)
    }

    pub async fn kill(&self, container_id: &str, exec_id: &str, signal: i32) -> Result<(), AgentError> {
        let exec = self.running_exec(container_id, exec_id).await?;
        exec.kill(signal)
    }

    pub async fn resize(&self, container_id: &str, exec_id: &str, rows: u16, cols: u16) -> Result<(), AgentError> {
        let exec = self.running_exec(container_id, exec_id).await?;
        exec.resize(rows, cols)
    }

    pub async fn close_stdin(&self, container_id: &str, exec_id: &str) -> Result<(), AgentError> {
        let exec = self.running_exec(container_id, exec_id).await?;
        exec.close_stdin();
        Ok(())
    }

    /// Tear down one exec, or the whole container if `exec_id` names its
    /// init process (spec §4.9 `deleteExec` invariant: "deleteExec on the
    /// container's own id deletes the container").
    pub async fn delete_exec(&self, container_id: &str, exec_id: &str) -> Result<(), AgentError> {
        if exec_id == container_id {
            return self.delete(container_id).await;
        }

        let mut containers = self.containers.lock().await;
        let entry = self.find_mut(&mut containers, container_id)?;
        if let Some(exec) = entry.execs.remove(exec_id) {
            exec.close_io();
            self.supervisor.remove(exec_id);
        }
        entry.bundle.remove_exec_spec(exec_id).await
    }

    /// Tear down a container: close every exec's I/O, remove the cgroup
    /// (retrying on EBUSY/EAGAIN, skipped when an external runtime owns
    /// cleanup), and remove the bundle directory (spec §4.9 `delete`).
    pub async fn delete(&self, container_id: &str) -> Result<(), AgentError> {
        let entry = {
            let mut containers = self.containers.lock().await;
            containers
                .remove(container_id)
                .ok_or_else(|| AgentError::invalid_state("ContainerManager::delete", format!("unknown container {container_id}")))?
        };

        for (id, exec) in &entry.execs {
            exec.close_io();
            self.supervisor.remove(id);
        }

        if matches!(entry.runtime, RuntimeMode::Native) {
            entry.cgroup.delete().await?;
        }
        entry.bundle.remove().await
    }

    /// Look up one `KEY=VALUE` entry in a process's stored spec (spec
    /// §4.10 "Environment": "Get/set process environment variables"). The
    /// process need not be running; this reads the bundle's persisted spec.
    pub async fn get_env(&self, container_id: &str, exec_id: &str, name: &str) -> Result<Option<String>, AgentError> {
        let containers = self.containers.lock().await;
        let entry = self.find(&containers, container_id)?;
        let spec = self.read_process_spec(entry, container_id, exec_id)?;
        Ok(find_env(&spec.env, name).map(|s| s.to_string()))
    }

    /// Set (or replace) one `KEY=VALUE` entry in a process's stored spec.
    /// Takes effect the next time that process is started.
    pub async fn set_env(&self, container_id: &str, exec_id: &str, name: &str, value: &str) -> Result<(), AgentError> {
        let containers = self.containers.lock().await;
        let entry = self.find(&containers, container_id)?;
        let mut spec = self.read_process_spec(entry, container_id, exec_id)?;
        set_env_entry(&mut spec.env, name, value);
        if exec_id == container_id {
            entry.bundle.rewrite_init_spec(&spec).await
        } else {
            entry.bundle.write_exec_spec(exec_id, &spec).await
        }
    }

    fn read_process_spec(&self, entry: &ContainerEntry, container_id: &str, exec_id: &str) -> Result<ProcessSpec, AgentError> {
        if exec_id == container_id {
            entry.bundle.read_init_spec()
        } else {
            entry.bundle.read_exec_spec(exec_id)
        }
    }

    /// Every container id this manager currently knows about, for a
    /// `GetStats` request naming no specific containers (spec §4.10: "For
    /// each requested container (or all)").
    pub async fn container_ids(&self) -> Vec<String> {
        self.containers.lock().await.keys().cloned().collect()
    }

    /// Read the requested cgroup categories for one container (spec §4.10
    /// Statistics).
    pub async fn stats(&self, container_id: &str, want: StatsWanted) -> Result<ContainerStatsRaw, AgentError> {
        let containers = self.containers.lock().await;
        let entry = self.find(&containers, container_id)?;
        let cgroup = &entry.cgroup;

        let mut raw = ContainerStatsRaw::default();
        if want.process_count {
            raw.process_count = Some(cgroup.process_count().await?);
        }
        if want.memory {
            raw.memory_current_bytes = Some(cgroup.memory_current().await?);
            raw.memory_stat = Some(cgroup.memory_stat().await?);
        }
        if want.memory_events {
            raw.memory_events = Some(cgroup.memory_events().await?);
        }
        if want.cpu {
            raw.cpu_stat = Some(cgroup.cpu_stat().await?);
        }
        if want.block_io {
            raw.io_stat_raw = Some(cgroup.io_stat_raw().await?);
        }
        Ok(raw)
    }

    async fn running_exec(&self, container_id: &str, exec_id: &str) -> Result<Arc<ManagedExec>, AgentError> {
        let containers = self.containers.lock().await;
        let entry = self.find(&containers, container_id)?;
        entry
            .execs
            .get(exec_id)
            .cloned()
            .ok_or_else(|| AgentError::invalid_state("ContainerManager::running_exec", format!("no running process {exec_id}")))
    }

    fn find<'a>(&self, containers: &'a HashMap<String, ContainerEntry>, container_id: &str) -> Result<&'a ContainerEntry, AgentError> {
        containers
            .get(container_id)
            .ok_or_else(|| AgentError::new(ErrorKind::InvalidState, "ContainerManager::find", format!("unknown container {container_id}")))
    }

    fn find_mut<'a>(
        &self,
        containers: &'a mut HashMap<String, ContainerEntry>,
        container_id: &str,
    ) -> Result<&'a mut ContainerEntry, AgentError> {
        containers
            .get_mut(container_id)
            .ok_or_else(|| AgentError::new(ErrorKind::InvalidState, "ContainerManager::find_mut", format!("unknown container {container_id}")))
    }
}

/// Find a `NAME=value` entry's value among `KEY=VALUE` environment strings.
fn find_env<'a>(env: &'a [String], name: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| entry.strip_prefix(name)?.strip_prefix('='))
}

/// Replace an existing `NAME=...` entry in place, or append a new one.
fn set_env_entry(env: &mut Vec<String>, name: &str, value: &str) {
    let prefix = format!("{name}=");
    match env.iter_mut().find(|entry| entry.starts_with(&prefix)) {
        Some(entry) => *entry = format!("{name}={value}"),
        None => env.push(format!("{name}={value}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::UserSpec;

    #[test]
    fn find_env_matches_exact_name_only() {
        let env = vec!["PATH=/bin".to_string(), "HOME=/root".to_string()];
        assert_eq!(find_env(&env, "HOME"), Some("/root"));
        assert_eq!(find_env(&env, "HOM"), None);
        assert_eq!(find_env(&env, "MISSING"), None);
    }

    #[test]
    fn set_env_entry_replaces_existing_and_appends_new() {
        let mut env = vec!["PATH=/bin".to_string()];
        set_env_entry(&mut env, "PATH", "/usr/bin");
        assert_eq!(env, vec!["PATH=/usr/bin".to_string()]);
        set_env_entry(&mut env, "HOME", "/root");
        assert_eq!(env, vec!["PATH=/usr/bin".to_string(), "HOME=/root".to_string()]);
    }

    fn sample_spec(id: &str, rootfs: &std::path::Path) -> ContainerSpec {
        ContainerSpec {
            id: id.to_string(),
            rootfs: rootfs.display().to_string(),
            hostname: None,
            cgroup_path: Some(rootfs.join("cgroup").display().to_string()),
            init: ProcessSpec {
                args: vec!["/bin/true".to_string()],
                env: vec![],
                cwd: "/".to_string(),
                terminal: false,
                user: UserSpec::default(),
            },
            runtime: RuntimeMode::Native,
        }
    }

    #[tokio::test]
    async fn create_exec_rejects_reusing_container_id() {
        let supervisor = Supervisor::new();
        let (_poller, handle) = vminit_poller::Poller::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = ContainerManager::new(supervisor, handle, dir.path().join("bundles"), dir.path().join("cgroups"));

        let err = manager.create_exec("c1", "c1", ProcessSpec {
            args: vec![],
            env: vec![],
            cwd: "/".to_string(),
            terminal: false,
            user: UserSpec::default(),
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn operations_on_unknown_container_are_invalid_state() {
        let supervisor = Supervisor::new();
        let (_poller, handle) = vminit_poller::Poller::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = ContainerManager::new(supervisor, handle, dir.path().join("bundles"), dir.path().join("cgroups"));

        let err = manager.wait("ghost", "ghost").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);

        let err = manager.delete("ghost").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn delete_exec_on_container_id_deletes_the_container() {
        // Forking and chrooting a real child requires root; skip under an
        // unprivileged test runner rather than fail on environment, not logic.
        if !nix::unistd::Uid::effective().is_root() {
            return;
        }
        let supervisor = Supervisor::new();
        let (_poller, handle) = vminit_poller::Poller::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        tokio::fs::create_dir_all(&rootfs).await.unwrap();
        let bundle_root = dir.path().join("bundles");
        let manager = ContainerManager::new(supervisor, handle, bundle_root.clone(), dir.path().join("cgroups"));

        manager.create(sample_spec("c1", &rootfs), HostStdio::default()).await.unwrap();
        assert!(Bundle::path_for(&bundle_root, "c1").exists());

        manager.delete_exec("c1", "c1").await.unwrap();
        assert!(!Bundle::path_for(&bundle_root, "c1").exists());
    }
}
