//! Builds router solicitations and parses router advertisements (spec §4.3).

pub mod options;

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use vminit_common::{AgentError, ErrorKind};
use vminit_icmp::IcmpSocket;

pub use options::NdOption;

const ICMPV6_ROUTER_SOLICITATION: u8 = 133;
const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;

/// `ff02::2`, the all-routers multicast address.
pub const ALL_ROUTERS_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Build a router-solicitation datagram: ICMPv6 header, 4 reserved zero
/// bytes, optional source-link-layer-address option (spec §4.3).
pub fn build_router_solicitation(source_link_layer_address: Option<[u8; 6]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.push(ICMPV6_ROUTER_SOLICITATION);
    buf.push(0); // code
    buf.extend_from_slice(&[0, 0]); // checksum placeholder; kernel computes for ICMPv6 raw sockets
    buf.extend_from_slice(&[0, 0, 0, 0]); // reserved

    if let Some(mac) = source_link_layer_address {
        NdOption::SourceLinkLayerAddress(mac).encode(&mut buf);
    }

    buf
}

/// Send a router solicitation to the all-routers multicast address, scoped
/// to `scope_id` (the outbound interface index).
pub async fn send_router_solicitation(
    socket: &IcmpSocket,
    scope_id: u32,
    source_link_layer_address: Option<[u8; 6]>,
) -> Result<usize, AgentError> {
    let packet = build_router_solicitation(source_link_layer_address);
    let dest = SocketAddr::V6(SocketAddrV6::new(ALL_ROUTERS_MULTICAST, 0, 0, scope_id));
    socket.send(&packet, dest).await
}

/// A parsed router advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAdvertisement {
    pub current_hop_limit: u8,
    pub managed_flag: bool,
    pub other_flag: bool,
    pub router_lifetime_secs: u16,
    pub reachable_time_ms: u32,
    pub retrans_timer_ms: u32,
    pub options: Vec<NdOption>,
}

impl RouterAdvertisement {
    pub fn rdnss_entries(&self) -> Vec<(Ipv6Addr, u32)> {
        self.options
            .iter()
            .filter_map(|opt| match opt {
                NdOption::RecursiveDnsServer { lifetime, addresses } => {
                    Some(addresses.iter().map(move |a| (*a, *lifetime)))
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.push(ICMPV6_ROUTER_ADVERTISEMENT);
        buf.push(0);
        buf.extend_from_slice(&[0, 0]); // checksum
        buf.push(self.current_hop_limit);
        let flags = (if self.managed_flag { 0x80 } else { 0 }) | (if self.other_flag { 0x40 } else { 0 });
        buf.push(flags);
        buf.extend_from_slice(&self.router_lifetime_secs.to_be_bytes());
        buf.extend_from_slice(&self.reachable_time_ms.to_be_bytes());
        buf.extend_from_slice(&self.retrans_timer_ms.to_be_bytes());
        for option in &self.options {
            option.encode(&mut buf);
        }
        buf
    }

    /// Parse a fixed header then an option list (spec §4.3).
    pub fn parse(buf: &[u8]) -> Result<Self, AgentError> {
        if buf.len() < 16 {
            return Err(AgentError::marshal("RouterAdvertisement", "header", "bind"));
        }
        if buf[0] != ICMPV6_ROUTER_ADVERTISEMENT {
            return Err(AgentError::new(
                ErrorKind::InvalidArgument,
                "RouterAdvertisement::parse",
                format!("unexpected ICMPv6 type {}", buf[0]),
            ));
        }
        let current_hop_limit = buf[4];
        let flags = buf[5];
        let router_lifetime_secs = u16::from_be_bytes([buf[6], buf[7]]);
        let reachable_time_ms = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let retrans_timer_ms = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let options = NdOption::parse_all(buf, 16)?;

        Ok(Self {
            current_hop_limit,
            managed_flag: flags & 0x80 != 0,
            other_flag: flags & 0x40 != 0,
            router_lifetime_secs,
            reachable_time_ms,
            retrans_timer_ms,
            options,
        })
    }
}

/// Drain incoming ICMPv6 datagrams on `socket` until one parses as a
/// router advertisement or `timeout` elapses (spec §4.3: "deadline computed
/// per call").
pub async fn receive_router_advertisement(
    socket: &IcmpSocket,
    timeout: Duration,
) -> Result<Option<RouterAdvertisement>, AgentError> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; 1500];

    loop {
        let received = match socket.receive_until(&mut buf, deadline).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let (len, _src) = received;
        match RouterAdvertisement::parse(&buf[..len]) {
            Ok(ra) => return Ok(Some(ra)),
            Err(_) => {
                debug!("dropped non-RA or malformed ICMPv6 datagram while waiting for RA");
                continue;
            }
        }
    }
}

/// Send a router solicitation and wait for the response. Failures to send
/// or receive are not fatal to the caller (spec §4.4: DNS monitor keeps
/// going after send/receive failures) — this helper still surfaces the
/// error so the caller can decide whether to log-and-continue.
pub async fn solicit_and_wait(
    socket: &IcmpSocket,
    scope_id: u32,
    source_link_layer_address: Option<[u8; 6]>,
    timeout: Duration,
) -> Result<Option<RouterAdvertisement>, AgentError> {
    if let Err(e) = send_router_solicitation(socket, scope_id, source_link_layer_address).await {
        warn!("failed to send router solicitation: {e}");
        return Err(e);
    }
    receive_router_advertisement(socket, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_solicitation_carries_reserved_zero_bytes() {
        let packet = build_router_solicitation(None);
        assert_eq!(packet[0], ICMPV6_ROUTER_SOLICITATION);
        assert_eq!(&packet[4..8], &[0, 0, 0, 0]);
        assert_eq!(packet.len(), 8);
    }

    #[test]
    fn router_solicitation_appends_source_link_layer_option() {
        let packet = build_router_solicitation(Some([1, 2, 3, 4, 5, 6]));
        assert_eq!(packet.len(), 16);
        assert_eq!(packet[8], options::OPT_SOURCE_LINK_LAYER_ADDRESS);
    }

    #[test]
    fn router_advertisement_round_trips_with_rdnss() {
        let ra = RouterAdvertisement {
            current_hop_limit: 64,
            managed_flag: false,
            other_flag: true,
            router_lifetime_secs: 1800,
            reachable_time_ms: 30000,
            retrans_timer_ms: 1000,
            options: vec![NdOption::RecursiveDnsServer {
                lifetime: 600,
                addresses: vec!["fd00::1".parse().unwrap()],
            }],
        };

        let buf = ra.encode();
        let parsed = RouterAdvertisement::parse(&buf).unwrap();
        assert_eq!(parsed, ra);

        let entries = parsed.rdnss_entries();
        assert_eq!(entries, vec![("fd00::1".parse().unwrap(), 600)]);
    }

    #[test]
    fn wrong_icmpv6_type_is_rejected() {
        let mut buf = vec![0u8; 16];
        buf[0] = 135; // neighbor solicitation, not an RA
        let err = RouterAdvertisement::parse(&buf).unwrap_err();
        assert_eq!(err.kind, vminit_common::ErrorKind::InvalidArgument);
    }
}
