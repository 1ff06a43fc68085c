//! Packet Classification
//!
//! Frame → IPv4 header → (client, direction)
//!
//! Anything that is not a complete IPv4 header is unidentified and falls
//! through to the fallback bucket. The classifier itself never drops.

use crate::registry::{ClientRecord, Registry};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;

const ETH_HDR_SIZE: usize = 14;
const ETH_P_IP: u16 = 0x0800;
const IPV4_MIN_HEADER_BYTES: usize = 20;
const TCP_HEADER_BYTES: usize = 20;
const PROTO_TCP: u8 = 6;

/// ECN field values (low two bits of the TOS byte)
const ECN_MASK: u8 = 0x03;
const ECN_NOT_ECT: u8 = 0x00;
const ECN_CE: u8 = 0x03;

/// Traffic direction relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards the client (client is the destination)
    Inbound,
    /// From the client (client is the source)
    Outbound,
}

/// What precedes the IP header in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkLayer {
    /// Frame starts at the IP header (tunnel interfaces)
    #[default]
    Ip,
    /// 14-byte Ethernet header first
    Ethernet,
}

/// Fields extracted from a well-formed IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Offset of the IP header within the frame
    pub l3_offset: usize,
    /// Header length in bytes (IHL * 4)
    pub header_len: usize,
    /// IP protocol
    pub protocol: u8,
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
    /// TCP (source, destination) ports, when a full TCP header is present
    pub ports: Option<(u16, u16)>,
}

/// Who a packet is charged to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// Known client
    Client {
        /// Registry record in effect for this packet
        record: ClientRecord,
        /// Direction relative to the client
        direction: Direction,
    },
    /// No address resolved (or the header was malformed)
    Unidentified,
}

/// Classifier output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Client and direction, if any
    pub attribution: Attribution,
    /// Frame length in bytes
    pub length: u64,
    /// Parsed header; `None` when the frame was not well-formed IPv4
    pub header: Option<Ipv4Header>,
}

impl Classification {
    /// The endpoint on the far side of the client: destination for
    /// outbound traffic, source for inbound. Port is 0 without TCP.
    pub fn remote(&self) -> Option<(Ipv4Addr, u16)> {
        let header = self.header?;
        match self.attribution {
            Attribution::Client {
                direction: Direction::Outbound,
                ..
            } => Some((header.dst, header.ports.map_or(0, |(_, dst)| dst))),
            Attribution::Client {
                direction: Direction::Inbound,
                ..
            } => Some((header.src, header.ports.map_or(0, |(src, _)| src))),
            Attribution::Unidentified => None,
        }
    }

    /// True when no IPv4 header could be parsed
    pub fn is_malformed(&self) -> bool {
        self.header.is_none()
    }
}

/// Parse the IPv4 header of `frame`
#[inline]
pub fn parse_ipv4(frame: &[u8], link: LinkLayer) -> Option<Ipv4Header> {
    let l3_offset = match link {
        LinkLayer::Ip => 0,
        LinkLayer::Ethernet => {
            if frame.len() < ETH_HDR_SIZE {
                return None;
            }
            if u16::from_be_bytes([frame[12], frame[13]]) != ETH_P_IP {
                return None;
            }
            ETH_HDR_SIZE
        }
    };

    let ip = frame.get(l3_offset..)?;
    if ip.len() < IPV4_MIN_HEADER_BYTES {
        return None;
    }

    let version_ihl = ip[0];
    if version_ihl >> 4 != 4 {
        return None;
    }
    let header_len = (version_ihl & 0x0f) as usize * 4;
    if header_len < IPV4_MIN_HEADER_BYTES || header_len > ip.len() {
        return None;
    }

    let protocol = ip[9];
    let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    let ports = if protocol == PROTO_TCP && ip.len() >= header_len + TCP_HEADER_BYTES {
        let l4 = &ip[header_len..];
        Some((
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
        ))
    } else {
        None
    };

    Some(Ipv4Header {
        l3_offset,
        header_len,
        protocol,
        src,
        dst,
        ports,
    })
}

/// Set congestion-experienced in the IPv4 header at `l3_offset`.
///
/// Only ECN-capable packets are rewritten; the header checksum is patched
/// incrementally (RFC 1624). Returns whether the header now carries CE.
pub fn set_ecn_ce(frame: &mut [u8], l3_offset: usize) -> bool {
    let Some(ip) = frame.get_mut(l3_offset..l3_offset + IPV4_MIN_HEADER_BYTES) else {
        return false;
    };

    let ecn = ip[1] & ECN_MASK;
    if ecn == ECN_NOT_ECT {
        return false;
    }
    if ecn == ECN_CE {
        return true;
    }

    let old = u16::from_be_bytes([ip[0], ip[1]]);
    ip[1] |= ECN_CE;
    let new = u16::from_be_bytes([ip[0], ip[1]]);

    let check = u16::from_be_bytes([ip[10], ip[11]]);
    let mut sum = (!check) as u32 + (!old) as u32 + new as u32;
    sum = (sum & 0xffff) + (sum >> 16);
    sum = (sum & 0xffff) + (sum >> 16);
    let check = !(sum as u16);
    ip[10..12].copy_from_slice(&check.to_be_bytes());

    true
}

/// Resolves packets to clients through the registry
pub struct Classifier {
    registry: Arc<Registry>,
    link_layer: LinkLayer,
}

impl Classifier {
    /// Create classifier
    pub fn new(registry: Arc<Registry>, link_layer: LinkLayer) -> Self {
        Self {
            registry,
            link_layer,
        }
    }

    /// Classify one frame
    #[inline]
    pub fn classify(&self, frame: &[u8]) -> Classification {
        let Some(header) = parse_ipv4(frame, self.link_layer) else {
            return Classification {
                attribution: Attribution::Unidentified,
                length: frame.len() as u64,
                header: None,
            };
        };

        let attribution = if let Some(record) = self.registry.lookup(header.src) {
            Attribution::Client {
                record,
                direction: Direction::Outbound,
            }
        } else if let Some(record) = self.registry.lookup(header.dst) {
            Attribution::Client {
                record,
                direction: Direction::Inbound,
            }
        } else {
            Attribution::Unidentified
        };

        Classification {
            attribution,
            length: frame.len() as u64,
            header: Some(header),
        }
    }

    /// Parse only, without registry lookups
    #[inline]
    pub fn parse(&self, frame: &[u8]) -> Option<Ipv4Header> {
        parse_ipv4(frame, self.link_layer)
    }
}
