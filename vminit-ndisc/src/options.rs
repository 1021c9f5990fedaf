//! Neighbor-discovery options (spec §3 "Neighbor-discovery option", §4.3).
//!
//! Each variant carries a constant "units of 8 bytes" length including its
//! 2-byte header, per the data model. Unknown types are skipped by
//! advancing the cursor by `8 * units - 2` bytes (spec §4.3, §8).

use std::net::Ipv6Addr;

use tracing::debug;
use vminit_common::{AgentError, ErrorKind};

pub const OPT_SOURCE_LINK_LAYER_ADDRESS: u8 = 1;
pub const OPT_PREFIX_INFORMATION: u8 = 3;
pub const OPT_MTU: u8 = 5;
pub const OPT_RDNSS: u8 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdOption {
    SourceLinkLayerAddress([u8; 6]),
    PrefixInformation {
        prefix_length: u8,
        on_link: bool,
        autonomous: bool,
        valid_lifetime: u32,
        preferred_lifetime: u32,
        prefix: Ipv6Addr,
    },
    Mtu(u32),
    RecursiveDnsServer {
        lifetime: u32,
        addresses: Vec<Ipv6Addr>,
    },
    /// Unknown or unimplemented option type, skipped during parsing.
    Unknown { option_type: u8, units: u8 },
}

impl NdOption {
    /// Length in units of 8 bytes, including the 2-byte type+length header.
    pub fn units(&self) -> u8 {
        match self {
            Self::SourceLinkLayerAddress(_) => 1, // 8 bytes total
            Self::PrefixInformation { .. } => 4,  // 32 bytes total
            Self::Mtu(_) => 1,                    // 8 bytes total
            Self::RecursiveDnsServer { addresses, .. } => {
                // 8-byte header (incl 2-byte type+len) + 16 bytes per address
                (1 + 2 * addresses.len()) as u8
            }
            Self::Unknown { units, .. } => *units,
        }
    }

    fn option_type(&self) -> u8 {
        match self {
            Self::SourceLinkLayerAddress(_) => OPT_SOURCE_LINK_LAYER_ADDRESS,
            Self::PrefixInformation { .. } => OPT_PREFIX_INFORMATION,
            Self::Mtu(_) => OPT_MTU,
            Self::RecursiveDnsServer { .. } => OPT_RDNSS,
            Self::Unknown { option_type, .. } => *option_type,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.option_type());
        buf.push(self.units());
        match self {
            Self::SourceLinkLayerAddress(mac) => {
                buf.extend_from_slice(mac);
            }
            Self::PrefixInformation {
                prefix_length,
                on_link,
                autonomous,
                valid_lifetime,
                preferred_lifetime,
                prefix,
            } => {
                buf.push(*prefix_length);
                let flags = (if *on_link { 0x80 } else { 0 }) | (if *autonomous { 0x40 } else { 0 });
                buf.push(flags);
                buf.extend_from_slice(&valid_lifetime.to_be_bytes());
                buf.extend_from_slice(&preferred_lifetime.to_be_bytes());
                buf.extend_from_slice(&0u32.to_be_bytes()); // reserved
                buf.extend_from_slice(&prefix.octets());
            }
            Self::Mtu(mtu) => {
                buf.extend_from_slice(&[0, 0]); // reserved
                buf.extend_from_slice(&mtu.to_be_bytes());
            }
            Self::RecursiveDnsServer { lifetime, addresses } => {
                buf.extend_from_slice(&[0, 0]); // reserved
                buf.extend_from_slice(&lifetime.to_be_bytes());
                for addr in addresses {
                    buf.extend_from_slice(&addr.octets());
                }
            }
            Self::Unknown { .. } => unreachable!("Unknown options are never constructed for encoding"),
        }
    }

    /// Parse one option starting at `offset`. Returns the option and the
    /// offset of the next option.
    pub fn parse(buf: &[u8], offset: usize) -> Result<(NdOption, usize), AgentError> {
        if offset + 2 > buf.len() {
            return Err(AgentError::marshal("NdOption", "header", "bind"));
        }
        let option_type = buf[offset];
        let units = buf[offset + 1];
        if units == 0 {
            // spec §9 Open Question: malformed zero-length option aborts the parse.
            return Err(AgentError::new(
                ErrorKind::InvalidArgument,
                "NdOption::parse",
                format!("option type {option_type} has lengthInUnits == 0"),
            ));
        }
        let payload_len = 8 * units as usize - 2;
        let payload_start = offset + 2;
        if payload_start + payload_len > buf.len() {
            return Err(AgentError::marshal("NdOption", "payload", "bind"));
        }
        let payload = &buf[payload_start..payload_start + payload_len];
        let next_offset = payload_start + payload_len;

        let option = match option_type {
            OPT_SOURCE_LINK_LAYER_ADDRESS if payload_len >= 6 => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&payload[0..6]);
                NdOption::SourceLinkLayerAddress(mac)
            }
            OPT_PREFIX_INFORMATION if payload_len >= 28 => {
                let prefix_length = payload[0];
                let flags = payload[1];
                let valid_lifetime = u32::from_be_bytes(payload[2..6].try_into().unwrap());
                let preferred_lifetime = u32::from_be_bytes(payload[6..10].try_into().unwrap());
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[14..30.min(payload_len)]);
                NdOption::PrefixInformation {
                    prefix_length,
                    on_link: flags & 0x80 != 0,
                    autonomous: flags & 0x40 != 0,
                    valid_lifetime,
                    preferred_lifetime,
                    prefix: Ipv6Addr::from(octets),
                }
            }
            OPT_MTU if payload_len >= 6 => {
                let mtu = u32::from_be_bytes(payload[2..6].try_into().unwrap());
                NdOption::Mtu(mtu)
            }
            OPT_RDNSS if payload_len >= 6 => {
                let lifetime = u32::from_be_bytes(payload[2..6].try_into().unwrap());
                let addr_bytes = &payload[6..];
                let addresses = addr_bytes
                    .chunks_exact(16)
                    .map(|chunk| {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(chunk);
                        Ipv6Addr::from(octets)
                    })
                    .collect();
                NdOption::RecursiveDnsServer { lifetime, addresses }
            }
            other => {
                debug!(option_type = other, units, "skipping unknown ND option");
                NdOption::Unknown { option_type: other, units }
            }
        };

        Ok((option, next_offset))
    }

    /// Parse every option in `buf` starting at `offset` until the buffer is
    /// exhausted.
    pub fn parse_all(buf: &[u8], mut offset: usize) -> Result<Vec<NdOption>, AgentError> {
        let mut options = Vec::new();
        while offset < buf.len() {
            let (option, next) = Self::parse(buf, offset)?;
            options.push(option);
            offset = next;
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdnss_round_trips_through_encode_and_parse() {
        let option = NdOption::RecursiveDnsServer {
            lifetime: 600,
            addresses: vec!["fd00::1".parse().unwrap()],
        };
        let mut buf = Vec::new();
        option.encode(&mut buf);
        assert_eq!(buf.len(), 24); // 8-byte header + one 16-byte address

        let (parsed, end) = NdOption::parse(&buf, 0).unwrap();
        assert_eq!(end, buf.len());
        assert_eq!(parsed, option);
    }

    #[test]
    fn unknown_option_advances_cursor_by_payload_length() {
        // type=99, units=2 (16 bytes total, 14 bytes payload)
        let mut buf = vec![99, 2];
        buf.extend_from_slice(&[0u8; 14]);
        buf.extend_from_slice(&[1, 1, 0, 0]); // trailing data to prove cursor lands correctly

        let (option, next) = NdOption::parse(&buf, 0).unwrap();
        assert!(matches!(option, NdOption::Unknown { option_type: 99, units: 2 }));
        assert_eq!(next, 16);
    }

    #[test]
    fn zero_length_units_aborts_parse() {
        let buf = vec![99, 0, 0, 0, 0, 0, 0, 0];
        let err = NdOption::parse(&buf, 0).unwrap_err();
        assert_eq!(err.kind, vminit_common::ErrorKind::InvalidArgument);
    }

    #[test]
    fn source_link_layer_address_round_trips() {
        let option = NdOption::SourceLinkLayerAddress([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let mut buf = Vec::new();
        option.encode(&mut buf);
        assert_eq!(buf.len(), 8);
        let (parsed, end) = NdOption::parse(&buf, 0).unwrap();
        assert_eq!(end, 8);
        assert_eq!(parsed, option);
    }
}
