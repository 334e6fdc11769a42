//! IP header parsing
//!
//! Extracts the 5-tuple from raw IPv4/IPv6 packets read off the virtual
//! device. Only the headers needed for classification are parsed; payloads
//! are never touched.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// IP protocol numbers the engine distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl Protocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 => Protocol::Icmp,
            58 => Protocol::Icmpv6,
            other => Protocol::Other(other),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp => 1,
            Protocol::Icmpv6 => 58,
            Protocol::Other(n) => *n,
        }
    }

    /// Does this protocol carry port numbers?
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Icmpv6 => write!(f, "ICMPv6"),
            Protocol::Other(n) => write!(f, "proto={}", n),
        }
    }
}

/// 5-tuple identifying one flow
///
/// Ports are zero for protocols without ports and for non-first fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FiveTuple {
    pub fn new(protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Protocol::Tcp, src, dst)
    }

    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Protocol::Udp, src, dst)
    }

    /// Tuple seen on reply packets (source and destination swapped)
    pub fn reverse(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

impl std::fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Parsed header of one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// IP version (4 or 6)
    pub version: u8,
    pub tuple: FiveTuple,
    /// Length of the whole packet
    pub len: usize,
}

impl PacketHeader {
    /// Destination address
    pub fn destination(&self) -> IpAddr {
        self.tuple.dst.ip()
    }

    /// Transport protocol
    pub fn protocol(&self) -> Protocol {
        self.tuple.protocol
    }

    /// Parse the IP header of a raw packet
    pub fn parse(packet: &[u8]) -> Result<Self, ClassificationError> {
        let first = *packet.first().ok_or(ClassificationError::Truncated { len: 0 })?;
        match first >> 4 {
            4 => parse_ipv4(packet),
            6 => parse_ipv6(packet),
            v => Err(ClassificationError::UnsupportedVersion(v)),
        }
    }
}

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

fn parse_ipv4(packet: &[u8]) -> Result<PacketHeader, ClassificationError> {
    if packet.len() < IPV4_MIN_HEADER {
        return Err(ClassificationError::Truncated { len: packet.len() });
    }

    let ihl = usize::from(packet[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER || ihl > packet.len() {
        return Err(ClassificationError::BadHeaderLength(ihl));
    }

    let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    if total_len < ihl || total_len > packet.len() {
        return Err(ClassificationError::LengthMismatch {
            declared: total_len,
            actual: packet.len(),
        });
    }

    // Non-first fragments carry no transport header
    let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    let protocol = Protocol::from_number(packet[9]);
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);

    let (src_port, dst_port) = if fragment_offset == 0 {
        read_ports(protocol, &packet[ihl..total_len])?
    } else {
        (0, 0)
    };

    Ok(PacketHeader {
        version: 4,
        tuple: FiveTuple::new(
            protocol,
            SocketAddr::new(IpAddr::V4(src), src_port),
            SocketAddr::new(IpAddr::V4(dst), dst_port),
        ),
        len: total_len,
    })
}

fn parse_ipv6(packet: &[u8]) -> Result<PacketHeader, ClassificationError> {
    if packet.len() < IPV6_HEADER {
        return Err(ClassificationError::Truncated { len: packet.len() });
    }

    let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
    let total_len = IPV6_HEADER + payload_len;
    if total_len > packet.len() {
        return Err(ClassificationError::LengthMismatch {
            declared: total_len,
            actual: packet.len(),
        });
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    dst.copy_from_slice(&packet[24..40]);

    // Walk extension headers until the upper-layer protocol
    let mut next = packet[6];
    let mut offset = IPV6_HEADER;
    let mut first_fragment = true;
    loop {
        match next {
            // Hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                if offset + 2 > total_len {
                    return Err(ClassificationError::Truncated { len: packet.len() });
                }
                next = packet[offset];
                offset += (usize::from(packet[offset + 1]) + 1) * 8;
            }
            // Fragment
            44 => {
                if offset + 8 > total_len {
                    return Err(ClassificationError::Truncated { len: packet.len() });
                }
                let frag = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) >> 3;
                first_fragment = frag == 0;
                next = packet[offset];
                offset += 8;
            }
            _ => break,
        }
        if offset > total_len {
            return Err(ClassificationError::BadHeaderLength(offset));
        }
    }

    let protocol = Protocol::from_number(next);
    let (src_port, dst_port) = if first_fragment {
        read_ports(protocol, &packet[offset..total_len])?
    } else {
        (0, 0)
    };

    Ok(PacketHeader {
        version: 6,
        tuple: FiveTuple::new(
            protocol,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
        ),
        len: total_len,
    })
}

fn read_ports(protocol: Protocol, transport: &[u8]) -> Result<(u16, u16), ClassificationError> {
    if !protocol.has_ports() {
        return Ok((0, 0));
    }
    if transport.len() < 4 {
        return Err(ClassificationError::Truncated { len: transport.len() });
    }
    Ok((
        u16::from_be_bytes([transport[0], transport[1]]),
        u16::from_be_bytes([transport[2], transport[3]]),
    ))
}

/// Malformed packet header; the packet is dropped and the tunnel continues
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    #[error("Truncated packet ({len} bytes)")]
    Truncated { len: usize },

    #[error("Unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("Bad header length {0}")]
    BadHeaderLength(usize),

    #[error("Declared length {declared} exceeds packet length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Build a minimal IPv4 packet with zeroed checksums
pub fn build_ipv4(protocol: Protocol, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let (IpAddr::V4(s), IpAddr::V4(d)) = (src.ip(), dst.ip()) else {
        return Vec::new();
    };

    let transport_len = if protocol.has_ports() { 8 } else { 0 };
    let total = IPV4_MIN_HEADER + transport_len + payload.len();
    let mut pkt = Vec::with_capacity(total);

    pkt.push(0x45); // version 4, IHL 5
    pkt.push(0);
    pkt.extend_from_slice(&(total as u16).to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0x40, 0]); // id, DF
    pkt.push(64); // TTL
    pkt.push(protocol.number());
    pkt.extend_from_slice(&[0, 0]); // checksum (unchecked)
    pkt.extend_from_slice(&s.octets());
    pkt.extend_from_slice(&d.octets());

    if protocol.has_ports() {
        pkt.extend_from_slice(&src.port().to_be_bytes());
        pkt.extend_from_slice(&dst.port().to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0, 0]);
    }
    pkt.extend_from_slice(payload);
    pkt
}
