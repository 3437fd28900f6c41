//! Minimal IPv4/IPv6 + UDP packet handling
//!
//! The tunnel only needs to pull DNS queries out of UDP datagrams and wrap
//! responses back up, so this module handles exactly that: plain UDP over
//! IPv4 (options allowed, fragments ignored) or IPv6 without extension
//! headers. Anything else parses to `None` and is dropped by the caller.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

/// A UDP datagram lifted out of an IP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

impl UdpPacket {
    pub fn new(src: SocketAddr, dst: SocketAddr, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            src,
            dst,
            payload: payload.into(),
        }
    }

    /// Parse a raw IP packet, returning `None` for anything that is not a
    /// complete, unfragmented UDP datagram.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        match packet.first()? >> 4 {
            4 => Self::parse_v4(packet),
            6 => Self::parse_v6(packet),
            _ => None,
        }
    }

    fn parse_v4(packet: &[u8]) -> Option<Self> {
        if packet.len() < IPV4_HEADER_LEN {
            return None;
        }
        let ihl = usize::from(packet[0] & 0x0f) * 4;
        let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
        if ihl < IPV4_HEADER_LEN || total < ihl + UDP_HEADER_LEN || total > packet.len() {
            return None;
        }

        // More-fragments flag or a non-zero offset
        let frag = u16::from_be_bytes([packet[6], packet[7]]);
        if frag & 0x3fff != 0 {
            return None;
        }
        if packet[9] != IPPROTO_UDP {
            return None;
        }

        let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
        let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        Self::parse_udp(src.into(), dst.into(), &packet[ihl..total])
    }

    fn parse_v6(packet: &[u8]) -> Option<Self> {
        if packet.len() < IPV6_HEADER_LEN {
            return None;
        }
        let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
        if packet[6] != IPPROTO_UDP || IPV6_HEADER_LEN + payload_len > packet.len() {
            return None;
        }

        let src: [u8; 16] = packet[8..24].try_into().ok()?;
        let dst: [u8; 16] = packet[24..40].try_into().ok()?;
        Self::parse_udp(
            Ipv6Addr::from(src).into(),
            Ipv6Addr::from(dst).into(),
            &packet[IPV6_HEADER_LEN..IPV6_HEADER_LEN + payload_len],
        )
    }

    fn parse_udp(src: IpAddr, dst: IpAddr, segment: &[u8]) -> Option<Self> {
        if segment.len() < UDP_HEADER_LEN {
            return None;
        }
        let src_port = u16::from_be_bytes([segment[0], segment[1]]);
        let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
        let len = usize::from(u16::from_be_bytes([segment[4], segment[5]]));
        if len < UDP_HEADER_LEN || len > segment.len() {
            return None;
        }

        Some(Self {
            src: SocketAddr::new(src, src_port),
            dst: SocketAddr::new(dst, dst_port),
            payload: segment[UDP_HEADER_LEN..len].to_vec(),
        })
    }

    /// Build the packet answering this one: addresses and ports swapped,
    /// `payload` as the UDP body.
    pub fn reply(&self, payload: &[u8]) -> Result<Vec<u8>> {
        build(self.dst, self.src, payload)
    }

    /// Serialize this datagram into a full IP packet
    pub fn encode(&self) -> Result<Vec<u8>> {
        build(self.src, self.dst, &self.payload)
    }
}

fn build(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let udp_len16 = u16::try_from(udp_len)
        .map_err(|_| Error::InvalidPacket(format!("UDP payload of {} bytes", payload.len())))?;

    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&src.port().to_be_bytes());
    udp.extend_from_slice(&dst.port().to_be_bytes());
    udp.extend_from_slice(&udp_len16.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total = u16::try_from(IPV4_HEADER_LEN + udp_len).map_err(|_| {
                Error::InvalidPacket(format!("IPv4 packet of {} bytes", IPV4_HEADER_LEN + udp_len))
            })?;

            let csum = finish(sum_words(&udp, pseudo_v4(s, d, udp_len16)));
            udp[6..8].copy_from_slice(&nonzero(csum).to_be_bytes());

            let mut packet = Vec::with_capacity(usize::from(total));
            packet.extend_from_slice(&[0x45, 0]);
            packet.extend_from_slice(&total.to_be_bytes());
            // id 0, don't fragment
            packet.extend_from_slice(&[0, 0, 0x40, 0]);
            packet.extend_from_slice(&[DEFAULT_TTL, IPPROTO_UDP, 0, 0]);
            packet.extend_from_slice(&s.octets());
            packet.extend_from_slice(&d.octets());
            let hcsum = finish(sum_words(&packet, 0));
            packet[10..12].copy_from_slice(&hcsum.to_be_bytes());
            packet.extend_from_slice(&udp);
            Ok(packet)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let csum = finish(sum_words(&udp, pseudo_v6(s, d, udp_len16)));
            udp[6..8].copy_from_slice(&nonzero(csum).to_be_bytes());

            let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + udp_len);
            packet.extend_from_slice(&[0x60, 0, 0, 0]);
            packet.extend_from_slice(&udp_len16.to_be_bytes());
            packet.extend_from_slice(&[IPPROTO_UDP, DEFAULT_TTL]);
            packet.extend_from_slice(&s.octets());
            packet.extend_from_slice(&d.octets());
            packet.extend_from_slice(&udp);
            Ok(packet)
        }
        _ => Err(Error::InvalidPacket(format!(
            "address family mismatch: {} -> {}",
            src, dst
        ))),
    }
}

/// Check the IPv4 header checksum (if any) and the UDP checksum of a packet
pub fn checksums_valid(packet: &[u8]) -> bool {
    let Some(parsed) = UdpPacket::parse(packet) else {
        return false;
    };
    let udp_len = (UDP_HEADER_LEN + parsed.payload.len()) as u16;

    match (parsed.src.ip(), parsed.dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let ihl = usize::from(packet[0] & 0x0f) * 4;
            if finish(sum_words(&packet[..ihl], 0)) != 0 {
                return false;
            }
            let segment = &packet[ihl..ihl + usize::from(udp_len)];
            // Zero means "no checksum" over IPv4
            segment[6..8] == [0, 0] || finish(sum_words(segment, pseudo_v4(s, d, udp_len))) == 0
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let segment = &packet[IPV6_HEADER_LEN..IPV6_HEADER_LEN + usize::from(udp_len)];
            finish(sum_words(segment, pseudo_v6(s, d, udp_len))) == 0
        }
        _ => false,
    }
}

fn pseudo_v4(src: Ipv4Addr, dst: Ipv4Addr, udp_len: u16) -> u64 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum + u64::from(IPPROTO_UDP) + u64::from(udp_len)
}

fn pseudo_v6(src: Ipv6Addr, dst: Ipv6Addr, udp_len: u16) -> u64 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum + u64::from(IPPROTO_UDP) + u64::from(udp_len)
}

/// One's-complement sum of big-endian 16-bit words, odd trailing byte padded
fn sum_words(data: &[u8], initial: u64) -> u64 {
    let mut chunks = data.chunks_exact(2);
    let mut sum = initial;
    for word in &mut chunks {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

fn finish(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A computed UDP checksum of zero goes on the wire as all ones
fn nonzero(csum: u16) -> u16 {
    if csum == 0 {
        0xffff
    } else {
        csum
    }
}
