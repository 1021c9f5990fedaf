//! The DNS monitor loop (spec §4.4): periodically solicits a router
//! advertisement on the monitored interface, merges any RDNSS entries into
//! the in-memory resolver state, and re-renders every registered resolver
//! file. Modeled on `hr-ipv6::ra::run_ra_sender`'s "own task, own socket,
//! keep going after a send/receive failure" shape.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tracing::{debug, warn};
use vminit_common::AgentError;
use vminit_icmp::IcmpSocket;
use vminit_ndisc::solicit_and_wait;

use crate::config::{DnsMonitorConfig, HostResolverConfig};
use crate::resolver_file::rewrite_resolver_file;
use crate::resolver_state::ResolverFileState;

const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Shared, lock-guarded monitor state: the merged resolver data plus every
/// file path currently registered to receive it.
pub struct DnsMonitor {
    config: DnsMonitorConfig,
    socket: IcmpSocket,
    state: Mutex<ResolverFileState>,
    paths: Mutex<HashMap<PathBuf, ()>>,
}

impl DnsMonitor {
    pub fn new(config: DnsMonitorConfig, socket: IcmpSocket) -> Self {
        Self {
            config,
            socket,
            state: Mutex::new(ResolverFileState::new()),
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or update) a resolver file path with its host-provided
    /// config, then immediately rewrite it. Idempotent: registering the same
    /// path with identical config is a no-op on disk (spec §4.4 "Update
    /// registration is idempotent").
    pub async fn register(&self, path: impl AsRef<Path>, host_config: HostResolverConfig) -> Result<(), AgentError> {
        let path = path.as_ref().to_path_buf();
        {
            let mut state = self.state.lock().await;
            state.update_host_config(host_config);
        }
        self.paths.lock().await.insert(path.clone(), ());
        let state = self.state.lock().await;
        rewrite_resolver_file(&path, &state, SystemTime::now()).await
    }

    pub async fn unregister(&self, path: impl AsRef<Path>) {
        self.paths.lock().await.remove(path.as_ref());
    }

    /// Run the monitor loop forever. Intended to be spawned as its own task;
    /// send/receive failures are logged and retried after a fixed backoff
    /// rather than propagated (spec §4.4 step 2).
    pub async fn run(&self) {
        if !self.config.enabled {
            debug!("DNS monitor disabled, not starting");
            return;
        }

        if let Err(e) = self.socket.bind_device(&self.config.interface).await {
            warn!("failed to bind DNS monitor socket to {}: {e}", self.config.interface);
        }

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = SystemTime::now();
                state.prune_expired(now);
                state.min_positive_wait(now)
            };

            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }

            let ra = solicit_and_wait(
                &self.socket,
                self.config.scope_id,
                self.config.source_link_layer_address,
                Duration::from_secs(self.config.ra_timeout_secs),
            )
            .await;

            match ra {
                Ok(Some(ra)) => {
                    let entries = ra.rdnss_entries();
                    let now = SystemTime::now();
                    {
                        let mut state = self.state.lock().await;
                        state.merge_rdnss(now, &entries);
                    }
                    self.rewrite_all(now).await;
                }
                Ok(None) => {
                    debug!("no router advertisement received within timeout");
                }
                Err(e) => {
                    warn!("DNS monitor solicitation failed: {e}");
                    tokio::time::sleep(FAILURE_BACKOFF).await;
                }
            }
        }
    }

    async fn rewrite_all(&self, now: SystemTime) {
        let paths: Vec<PathBuf> = self.paths.lock().await.keys().cloned().collect();
        let state = self.state.lock().await;
        for path in paths {
            if let Err(e) = rewrite_resolver_file(&path, &state, now).await {
                warn!("failed to rewrite resolver file {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_writes_file_immediately() {
        let socket = match IcmpSocket::new_v6() {
            Ok(s) => s,
            Err(_) => return, // unprivileged test environment, skip
        };
        let monitor = DnsMonitor::new(DnsMonitorConfig::default(), socket);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");

        monitor
            .register(
                &path,
                HostResolverConfig {
                    nameservers: vec!["10.0.0.1".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "nameserver 10.0.0.1\n");
    }

    #[tokio::test]
    async fn unregister_stops_future_rewrites() {
        let socket = match IcmpSocket::new_v6() {
            Ok(s) => s,
            Err(_) => return,
        };
        let monitor = DnsMonitor::new(DnsMonitorConfig::default(), socket);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        monitor.register(&path, HostResolverConfig::default()).await.unwrap();
        monitor.unregister(&path).await;
        assert!(monitor.paths.lock().await.is_empty());
    }
}
