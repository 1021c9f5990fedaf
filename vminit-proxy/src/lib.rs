//! Socket-to-socket stream proxy (spec §4.7): accepts on a UNIX or
//! host-guest (vsock) socket and splices each connection to the other
//! family. Start/stop follows the same "watch-channel shutdown, task
//! handle, idempotent stop" shape as `hr-agent::proxy::AgentProxy`.

pub mod config;
pub mod splice;

pub use config::{ProxyDirection, ProxySpec};

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream, VMADDR_CID_ANY, VMADDR_CID_HOST};
use tracing::{debug, info, warn};
use vminit_common::{AgentError, ErrorKind};

/// One running (or stopped) proxy. Construction does not start listening;
/// call [`StreamProxy::start`].
pub struct StreamProxy {
    spec: ProxySpec,
    started: AtomicBool,
    shutdown_tx: std::sync::Mutex<Option<watch::Sender<bool>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamProxy {
    pub fn new(spec: ProxySpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            started: AtomicBool::new(false),
            shutdown_tx: std::sync::Mutex::new(None),
            task: std::sync::Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Idempotent: starting an already-started proxy is a no-op (spec §8).
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);

        let proxy = self.clone();
        let handle = match self.spec.direction {
            ProxyDirection::ListenUnixDialVsock => {
                let listener = bind_unix_listener(&self.spec.path, self.spec.permissions).await?;
                tokio::spawn(accept_unix_dial_vsock(proxy, listener, shutdown_rx))
            }
            ProxyDirection::ListenVsockDialUnix => {
                let listener = bind_vsock_listener(self.spec.port)?;
                tokio::spawn(accept_vsock_dial_unix(proxy, listener, shutdown_rx))
            }
        };

        *self.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Idempotent: stopping an already-stopped proxy is a no-op. Cancels
    /// the accept task, and for the UNIX-listening direction removes the
    /// socket path (spec §4.7: "stop cancels the accept task, closes the
    /// listener, and removes the UNIX path if present").
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task.lock().unwrap().take() {
            let _ = handle.await;
        }

        if self.spec.direction == ProxyDirection::ListenUnixDialVsock {
            let _ = tokio::fs::remove_file(&self.spec.path).await;
        }
    }
}

async fn bind_unix_listener(path: &Path, permissions: Option<u32>) -> Result<UnixListener, AgentError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentError::from_errno("StreamProxy::start", e))?;
    }
    let _ = tokio::fs::remove_file(path).await; // stale socket from a prior run

    let previous_umask = nix::sys::stat::umask(nix::sys::stat::Mode::empty());
    let listener = UnixListener::bind(path).map_err(|e| AgentError::from_errno("StreamProxy::start", e));
    nix::sys::stat::umask(previous_umask);
    let listener = listener?;

    if let Some(mode) = permissions {
        let perms = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|e| AgentError::from_errno("StreamProxy::start", e))?;
    }

    Ok(listener)
}

fn bind_vsock_listener(port: u32) -> Result<VsockListener, AgentError> {
    let addr = VsockAddr::new(VMADDR_CID_ANY, port);
    VsockListener::bind(addr).map_err(|e| AgentError::from_errno("StreamProxy::start", e))
}

async fn accept_unix_dial_vsock(proxy: Arc<StreamProxy>, listener: UnixListener, mut shutdown_rx: watch::Receiver<bool>) {
    info!(id = proxy.id(), path = %proxy.spec.path.display(), "stream proxy listening on unix socket");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (unix_stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(id = proxy.id(), "unix accept failed: {e}");
                        continue;
                    }
                };
                let dest = VsockAddr::new(VMADDR_CID_HOST, proxy.spec.port);
                tokio::spawn(async move {
                    match VsockStream::connect(dest).await {
                        Ok(vsock_stream) => {
                            let outcome = splice::splice(unix_stream, vsock_stream).await;
                            debug!(?outcome, "stream proxy connection closed");
                        }
                        Err(e) => warn!("failed to dial host vsock port: {e}"),
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn accept_vsock_dial_unix(proxy: Arc<StreamProxy>, listener: VsockListener, mut shutdown_rx: watch::Receiver<bool>) {
    info!(id = proxy.id(), port = proxy.spec.port, "stream proxy listening on vsock");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (vsock_stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(id = proxy.id(), "vsock accept failed: {e}");
                        continue;
                    }
                };
                let path = proxy.spec.path.clone();
                tokio::spawn(async move {
                    match UnixStream::connect(&path).await {
                        Ok(unix_stream) => {
                            let outcome = splice::splice(vsock_stream, unix_stream).await;
                            debug!(?outcome, "stream proxy connection closed");
                        }
                        Err(e) => warn!("failed to dial unix socket {}: {e}", path.display()),
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// All proxies the dispatcher currently knows about, keyed by id.
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: std::sync::Mutex<std::collections::HashMap<String, Arc<StreamProxy>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, spec: ProxySpec) -> Result<(), AgentError> {
        let id = spec.id.clone();
        let proxy = {
            let mut proxies = self.proxies.lock().unwrap();
            proxies.entry(id).or_insert_with(|| StreamProxy::new(spec)).clone()
        };
        proxy.start().await
    }

    pub async fn stop(&self, id: &str) -> Result<(), AgentError> {
        let proxy = self.proxies.lock().unwrap().remove(id);
        match proxy {
            Some(proxy) => {
                proxy.stop().await;
                Ok(())
            }
            None => Err(AgentError::not_found("StreamProxy::stop", format!("no proxy registered with id {id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unix_listener_bind_creates_socket_with_requested_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        let listener = bind_unix_listener(&path, Some(0o600)).await.unwrap();
        drop(listener);

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn registry_stop_on_unknown_id_is_not_found() {
        let registry = ProxyRegistry::new();
        let err = registry.stop("missing").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
