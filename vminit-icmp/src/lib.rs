//! Raw ICMPv4/ICMPv6 datagram transport (spec §4.2).
//!
//! Constructible from nothing, yields a file descriptor bound to the
//! appropriate address family/protocol. Access is serialized by an
//! internal async mutex — the fd is shared but never concurrently used,
//! the same "one socket, one owner at a time" discipline
//! `hr-ipv6::ra::run_ra_sender` uses for its single `socket2::Socket`.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;
use vminit_common::{AgentError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

/// A raw ICMP socket, serialized for single-writer access.
pub struct IcmpSocket {
    inner: Mutex<UdpSocket>,
    family: Family,
}

impl IcmpSocket {
    /// Open a raw ICMPv4 socket.
    pub fn new_v4() -> Result<Self, AgentError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|e| map_open_error("ICMPv4Socket::open", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| AgentError::from_errno("ICMPv4Socket::open", e))?;
        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket =
            UdpSocket::from_std(std_socket).map_err(|e| AgentError::from_errno("ICMPv4Socket::open", e))?;
        Ok(Self {
            inner: Mutex::new(tokio_socket),
            family: Family::V4,
        })
    }

    /// Open a raw ICMPv6 socket. Sets multicast hop limit to 255, as router
    /// solicitation requires (spec §4.2).
    pub fn new_v6() -> Result<Self, AgentError> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
            .map_err(|e| map_open_error("ICMPv6Socket::open", e))?;
        socket
            .set_multicast_hops_v6(255)
            .map_err(|e| AgentError::from_errno("ICMPv6Socket::open", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| AgentError::from_errno("ICMPv6Socket::open", e))?;
        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket =
            UdpSocket::from_std(std_socket).map_err(|e| AgentError::from_errno("ICMPv6Socket::open", e))?;
        Ok(Self {
            inner: Mutex::new(tokio_socket),
            family: Family::V6,
        })
    }

    /// Bind the socket to a specific outbound interface (used by the ND
    /// engine to scope router solicitations).
    pub async fn bind_device(&self, ifname: &str) -> Result<(), AgentError> {
        #[cfg(target_os = "linux")]
        {
            let guard = self.inner.lock().await;
            let std_ref = guard.as_ref();
            socket2::SockRef::from(std_ref)
                .bind_device(Some(ifname.as_bytes()))
                .map_err(|e| AgentError::from_errno("IcmpSocket::bind_device", e))?;
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = ifname;
        }
        Ok(())
    }

    pub async fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize, AgentError> {
        let socket = self.inner.lock().await;
        socket
            .send_to(bytes, dest)
            .await
            .map_err(|e| AgentError::from_errno("IcmpSocket::send", e))
    }

    pub async fn receive(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), AgentError> {
        let socket = self.inner.lock().await;
        socket
            .recv_from(buf)
            .await
            .map_err(|e| AgentError::from_errno("IcmpSocket::receive", e))
    }

    /// Receive, but give up once `deadline` elapses; not an error, just `None`.
    pub async fn receive_until(
        &self,
        buf: &mut [u8],
        deadline: std::time::Instant,
    ) -> Result<Option<(usize, SocketAddr)>, AgentError> {
        let now = std::time::Instant::now();
        if deadline <= now {
            return Ok(None);
        }
        let timeout = deadline - now;
        match tokio::time::timeout(timeout, self.receive(buf)).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    pub fn family(&self) -> &'static str {
        match self.family {
            Family::V4 => "icmpv4",
            Family::V6 => "icmpv6",
        }
    }
}

impl Drop for IcmpSocket {
    fn drop(&mut self) {
        debug!(family = self.family(), "closing raw ICMP socket");
    }
}

fn map_open_error(op: &str, err: std::io::Error) -> AgentError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        AgentError::new(
            ErrorKind::Internal,
            op,
            format!("permission denied opening raw socket: {err}"),
        )
    } else {
        AgentError::from_errno(op, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw sockets require CAP_NET_RAW; these constructors are exercised in
    // integration contexts where the process runs privileged. Here we only
    // assert the permission-denied mapping shape when construction fails
    // under an unprivileged test runner, without asserting unconditional
    // success (raw socket creation cannot be unit-tested portably).
    #[test]
    fn family_label_matches_constructor() {
        match IcmpSocket::new_v4() {
            Ok(s) => assert_eq!(s.family(), "icmpv4"),
            Err(e) => assert_eq!(e.kind, ErrorKind::Internal),
        }
    }
}
