//! Raw IP packet parsing and injection.
//!
//! The engine sits on the raw-packet side of a TUN interface, so this
//! module does the minimal L3/L4 work: extract protocol, addresses and
//! ports from inbound packets, and rebuild IPv4 packets (with header and
//! L4 checksums) for the return path. Anything that cannot be parsed is
//! a `MalformedPacket` and gets dropped by the caller.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::common::EngineError;

/// L4 protocol carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl IpProtocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            1 | 58 => Self::Icmp, // ICMPv4 = 1, ICMPv6 = 58
            6 => Self::Tcp,
            17 => Self::Udp,
            other => Self::Other(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::Other(_) => "other",
        }
    }
}

/// Parsed header view over a raw IP packet.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub version: u8,
    pub protocol: IpProtocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the L4 header within the raw packet.
    pub payload_offset: usize,
    pub total_len: usize,
}

/// Identity of a flow: exact-field equality, derived once per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: IpProtocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn from_parsed(p: &ParsedPacket) -> Self {
        Self {
            protocol: p.protocol,
            src: SocketAddr::new(p.src_ip, p.src_port),
            dst: SocketAddr::new(p.dst_ip, p.dst_port),
        }
    }

    /// Key for the return direction of this flow.
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}→{}", self.protocol.as_str(), self.src, self.dst)
    }
}

/// TCP flag states relevant to session tracking.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

pub fn parse_ip_packet(data: &[u8]) -> Result<ParsedPacket, EngineError> {
    if data.is_empty() {
        return Err(EngineError::MalformedPacket("empty packet".into()));
    }

    let version = data[0] >> 4;
    match version {
        4 => parse_ipv4_packet(data),
        6 => parse_ipv6_packet(data),
        v => Err(EngineError::MalformedPacket(format!(
            "unsupported IP version: {}",
            v
        ))),
    }
}

fn parse_ipv4_packet(data: &[u8]) -> Result<ParsedPacket, EngineError> {
    if data.len() < 20 {
        return Err(EngineError::MalformedPacket(format!(
            "IPv4 packet too short: {} bytes",
            data.len()
        )));
    }

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < 20 || data.len() < ihl {
        return Err(EngineError::MalformedPacket(format!("invalid IPv4 IHL: {}", ihl)));
    }

    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let protocol = IpProtocol::from_number(data[9]);

    let src_ip = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));

    let (src_port, dst_port) = l4_ports(data, ihl, protocol)?;

    Ok(ParsedPacket {
        version: 4,
        protocol,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        payload_offset: ihl,
        total_len,
    })
}

fn parse_ipv6_packet(data: &[u8]) -> Result<ParsedPacket, EngineError> {
    if data.len() < 40 {
        return Err(EngineError::MalformedPacket(format!(
            "IPv6 packet too short: {} bytes",
            data.len()
        )));
    }

    let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let protocol = IpProtocol::from_number(data[6]);

    let mut src_bytes = [0u8; 16];
    src_bytes.copy_from_slice(&data[8..24]);
    let src_ip = IpAddr::V6(src_bytes.into());

    let mut dst_bytes = [0u8; 16];
    dst_bytes.copy_from_slice(&data[24..40]);
    let dst_ip = IpAddr::V6(dst_bytes.into());

    let l4_offset = 40;
    let (src_port, dst_port) = l4_ports(data, l4_offset, protocol)?;

    Ok(ParsedPacket {
        version: 6,
        protocol,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        payload_offset: l4_offset,
        total_len: 40 + payload_len,
    })
}

fn l4_ports(data: &[u8], offset: usize, protocol: IpProtocol) -> Result<(u16, u16), EngineError> {
    if !matches!(protocol, IpProtocol::Tcp | IpProtocol::Udp) {
        return Ok((0, 0));
    }
    if data.len() < offset + 4 {
        return Err(EngineError::MalformedPacket(
            "packet truncated before L4 ports".into(),
        ));
    }
    Ok((
        u16::from_be_bytes([data[offset], data[offset + 1]]),
        u16::from_be_bytes([data[offset + 2], data[offset + 3]]),
    ))
}

/// Extract TCP flags and sequence number. `payload_offset` must point at
/// the TCP header.
pub fn parse_tcp_header(data: &[u8], payload_offset: usize) -> Result<(TcpFlags, u32, usize), EngineError> {
    if data.len() < payload_offset + 20 {
        return Err(EngineError::MalformedPacket("TCP header truncated".into()));
    }
    let flags_byte = data[payload_offset + 13];
    let flags = TcpFlags {
        syn: flags_byte & 0x02 != 0,
        ack: flags_byte & 0x10 != 0,
        fin: flags_byte & 0x01 != 0,
        rst: flags_byte & 0x04 != 0,
    };
    let seq = u32::from_be_bytes([
        data[payload_offset + 4],
        data[payload_offset + 5],
        data[payload_offset + 6],
        data[payload_offset + 7],
    ]);
    let data_offset = ((data[payload_offset + 12] >> 4) as usize) * 4;
    if data_offset < 20 || data.len() < payload_offset + data_offset {
        return Err(EngineError::MalformedPacket(format!(
            "invalid TCP data offset: {}",
            data_offset
        )));
    }
    Ok((flags, seq, payload_offset + data_offset))
}

/// Extract the UDP payload. `payload_offset` must point at the UDP header.
pub fn udp_payload(data: &[u8], payload_offset: usize) -> Result<&[u8], EngineError> {
    if data.len() < payload_offset + 8 {
        return Err(EngineError::MalformedPacket("UDP header truncated".into()));
    }
    Ok(&data[payload_offset + 8..])
}

/// Build an IPv4 UDP packet from `src` to `dst` carrying `payload`.
pub fn build_udp_packet_ipv4(
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
) -> Result<Vec<u8>, EngineError> {
    let (src_ip, dst_ip) = ipv4_pair(src, dst)?;

    let ip_header_len = 20usize;
    let udp_header_len = 8usize;
    let total_len = ip_header_len + udp_header_len + payload.len();
    if total_len > u16::MAX as usize {
        return Err(EngineError::MalformedPacket(format!(
            "udp packet too large: {} bytes",
            total_len
        )));
    }

    let mut packet = vec![0u8; total_len];
    write_ipv4_header(&mut packet, total_len, 17, src_ip, dst_ip);

    packet[20..22].copy_from_slice(&src.port().to_be_bytes());
    packet[22..24].copy_from_slice(&dst.port().to_be_bytes());
    packet[24..26].copy_from_slice(&((udp_header_len + payload.len()) as u16).to_be_bytes());
    packet[26..28].copy_from_slice(&0u16.to_be_bytes());
    packet[28..].copy_from_slice(payload);

    let csum = ipv4_header_checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&csum.to_be_bytes());
    Ok(packet)
}

/// Build an IPv4 TCP segment from `src` to `dst` with explicit seq/ack
/// numbers and flag byte.
pub fn build_tcp_packet_ipv4(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>, EngineError> {
    let (src_ip, dst_ip) = ipv4_pair(src, dst)?;

    let ip_header_len = 20usize;
    let tcp_header_len = 20usize;
    let total_len = ip_header_len + tcp_header_len + payload.len();
    if total_len > u16::MAX as usize {
        return Err(EngineError::MalformedPacket(format!(
            "tcp packet too large: {} bytes",
            total_len
        )));
    }

    let mut packet = vec![0u8; total_len];
    write_ipv4_header(&mut packet, total_len, 6, src_ip, dst_ip);

    packet[20..22].copy_from_slice(&src.port().to_be_bytes());
    packet[22..24].copy_from_slice(&dst.port().to_be_bytes());
    packet[24..28].copy_from_slice(&seq.to_be_bytes());
    packet[28..32].copy_from_slice(&ack.to_be_bytes());
    packet[32] = (5u8 << 4) & 0xF0;
    packet[33] = flags;
    packet[34..36].copy_from_slice(&(65535u16).to_be_bytes());
    packet[36..38].copy_from_slice(&0u16.to_be_bytes());
    packet[38..40].copy_from_slice(&0u16.to_be_bytes());
    packet[40..].copy_from_slice(payload);

    let ip_csum = ipv4_header_checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&ip_csum.to_be_bytes());

    let tcp_len = (tcp_header_len + payload.len()) as u16;
    let tcp_csum = tcp_checksum_ipv4(src_ip, dst_ip, &packet[20..], tcp_len);
    packet[36..38].copy_from_slice(&tcp_csum.to_be_bytes());

    Ok(packet)
}

fn ipv4_pair(src: SocketAddr, dst: SocketAddr) -> Result<(Ipv4Addr, Ipv4Addr), EngineError> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => Ok((s, d)),
        _ => Err(EngineError::MalformedPacket(
            "ipv6 packet injection is not implemented yet".into(),
        )),
    }
}

fn write_ipv4_header(packet: &mut [u8], total_len: usize, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    packet[0] = 0x45;
    packet[1] = 0;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&0u16.to_be_bytes());
    packet[6..8].copy_from_slice(&0u16.to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
}

fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < header.len() {
        if i == 10 {
            i += 2;
            continue;
        }
        let word = u16::from_be_bytes([header[i], header[i + 1]]) as u32;
        sum = sum.wrapping_add(word);
        i += 2;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn tcp_checksum_ipv4(src: Ipv4Addr, dst: Ipv4Addr, tcp_segment: &[u8], tcp_len: u16) -> u16 {
    let mut sum: u32 = 0;

    let src_octets = src.octets();
    let dst_octets = dst.octets();
    sum = sum.wrapping_add(u16::from_be_bytes([src_octets[0], src_octets[1]]) as u32);
    sum = sum.wrapping_add(u16::from_be_bytes([src_octets[2], src_octets[3]]) as u32);
    sum = sum.wrapping_add(u16::from_be_bytes([dst_octets[0], dst_octets[1]]) as u32);
    sum = sum.wrapping_add(u16::from_be_bytes([dst_octets[2], dst_octets[3]]) as u32);
    sum = sum.wrapping_add(6u32);
    sum = sum.wrapping_add(tcp_len as u32);

    let mut i = 0usize;
    while i + 1 < tcp_segment.len() {
        let word = u16::from_be_bytes([tcp_segment[i], tcp_segment[i + 1]]) as u32;
        sum = sum.wrapping_add(word);
        i += 2;
    }
    if i < tcp_segment.len() {
        sum = sum.wrapping_add((tcp_segment[i] as u32) << 8);
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_packet(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
        build_udp_packet_ipv4(src.parse().unwrap(), dst.parse().unwrap(), payload).unwrap()
    }

    #[test]
    fn parse_rejects_empty() {
        let err = parse_ip_packet(&[]).unwrap_err();
        assert!(matches!(err, EngineError::MalformedPacket(_)));
    }

    #[test]
    fn parse_rejects_bad_version() {
        let err = parse_ip_packet(&[0x25; 20]).unwrap_err();
        assert!(err.to_string().contains("IP version"));
    }

    #[test]
    fn parse_rejects_short_ipv4() {
        let err = parse_ip_packet(&[0x45, 0, 0, 10]).unwrap_err();
        assert!(matches!(err, EngineError::MalformedPacket(_)));
    }

    #[test]
    fn udp_round_trip() {
        let packet = udp_packet("10.0.0.2:50000", "8.8.8.8:53", b"query");
        let parsed = parse_ip_packet(&packet).unwrap();
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.src_port, 50000);
        assert_eq!(parsed.dst_port, 53);
        assert_eq!(udp_payload(&packet, parsed.payload_offset).unwrap(), b"query");
    }

    #[test]
    fn tcp_round_trip() {
        let packet = build_tcp_packet_ipv4(
            "10.0.0.2:40000".parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
            100,
            0,
            0x02, // SYN
            &[],
        )
        .unwrap();
        let parsed = parse_ip_packet(&packet).unwrap();
        assert_eq!(parsed.protocol, IpProtocol::Tcp);
        let (flags, seq, payload_start) = parse_tcp_header(&packet, parsed.payload_offset).unwrap();
        assert!(flags.syn);
        assert!(!flags.ack);
        assert_eq!(seq, 100);
        assert_eq!(payload_start, packet.len());
    }

    #[test]
    fn flow_key_from_udp() {
        let packet = udp_packet("10.0.0.2:50000", "8.8.8.8:53", b"x");
        let parsed = parse_ip_packet(&packet).unwrap();
        let key = FlowKey::from_parsed(&parsed);
        assert_eq!(key.protocol, IpProtocol::Udp);
        assert_eq!(key.src, "10.0.0.2:50000".parse().unwrap());
        assert_eq!(key.dst, "8.8.8.8:53".parse().unwrap());

        let rev = key.reversed();
        assert_eq!(rev.src, key.dst);
        assert_eq!(rev.dst, key.src);
        assert_eq!(rev.protocol, key.protocol);
    }

    #[test]
    fn flow_key_exact_equality() {
        let a = FlowKey {
            protocol: IpProtocol::Tcp,
            src: "10.0.0.2:1000".parse().unwrap(),
            dst: "1.1.1.1:443".parse().unwrap(),
        };
        let mut b = a;
        assert_eq!(a, b);
        b.src = "10.0.0.2:1001".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ipv6_injection_unsupported() {
        let err = build_udp_packet_ipv4(
            "[2001:db8::1]:53".parse().unwrap(),
            "[2001:db8::2]:53000".parse().unwrap(),
            b"x",
        )
        .unwrap_err();
        assert!(err.to_string().contains("ipv6"));
    }

    #[test]
    fn ipv6_parse_extracts_ports() {
        // 40-byte IPv6 header + 8-byte UDP header
        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&8u16.to_be_bytes());
        packet[6] = 17; // UDP
        packet[40..42].copy_from_slice(&5353u16.to_be_bytes());
        packet[42..44].copy_from_slice(&53u16.to_be_bytes());
        let parsed = parse_ip_packet(&packet).unwrap();
        assert_eq!(parsed.version, 6);
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.src_port, 5353);
        assert_eq!(parsed.dst_port, 53);
    }
}
