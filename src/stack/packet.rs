//! IPv4/IPv6 + TCP/UDP parsing and packet construction

use crate::error::PacketError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// IP protocol number for TCP
pub const PROTO_TCP: u8 = 6;
/// IP protocol number for UDP
pub const PROTO_UDP: u8 = 17;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

/// TCP option kind carrying the maximum segment size
const TCP_OPT_MSS: u8 = 2;

/// TCP control bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    /// No more data from sender
    pub const FIN: TcpFlags = TcpFlags(0x01);
    /// Synchronize sequence numbers
    pub const SYN: TcpFlags = TcpFlags(0x02);
    /// Reset the connection
    pub const RST: TcpFlags = TcpFlags(0x04);
    /// Push
    pub const PSH: TcpFlags = TcpFlags(0x08);
    /// Acknowledgment field is significant
    pub const ACK: TcpFlags = TcpFlags(0x10);

    /// Whether every bit of `other` is set
    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

/// Parsed TCP segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// Control bits
    pub flags: TcpFlags,
    /// Advertised receive window
    pub window: u16,
    /// MSS option, only meaningful on SYN
    pub mss: Option<u16>,
    /// Segment data
    pub payload: &'a [u8],
}

/// Transport layer of a parsed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport<'a> {
    /// TCP segment
    Tcp(TcpSegment<'a>),
    /// UDP payload
    Udp(&'a [u8]),
}

/// A parsed IP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Source endpoint
    pub src: SocketAddr,
    /// Destination endpoint
    pub dst: SocketAddr,
    /// Transport layer
    pub transport: Transport<'a>,
}

fn need(buf: &[u8], len: usize) -> Result<(), PacketError> {
    if buf.len() < len {
        return Err(PacketError::Truncated {
            need: len,
            have: buf.len(),
        });
    }
    Ok(())
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Parse a raw IP packet
///
/// With `verify` set, the IPv4 header checksum and the TCP/UDP checksum
/// must match.
pub fn parse(buf: &[u8], verify: bool) -> Result<Packet<'_>, PacketError> {
    need(buf, 1)?;
    match buf[0] >> 4 {
        4 => parse_ipv4(buf, verify),
        6 => parse_ipv6(buf, verify),
        v => Err(PacketError::UnsupportedVersion(v)),
    }
}

fn parse_ipv4(buf: &[u8], verify: bool) -> Result<Packet<'_>, PacketError> {
    need(buf, IPV4_HEADER_LEN)?;
    let ihl = ((buf[0] & 0x0f) as usize) * 4;
    if ihl < IPV4_HEADER_LEN {
        return Err(PacketError::InvalidHeader("ipv4 header length"));
    }
    need(buf, ihl)?;
    let total = be16(buf, 2) as usize;
    if total < ihl {
        return Err(PacketError::InvalidHeader("ipv4 total length"));
    }
    need(buf, total)?;

    let frag = be16(buf, 6);
    if frag & 0x2000 != 0 || frag & 0x1fff != 0 {
        return Err(PacketError::Fragmented);
    }
    if verify && checksum(&buf[..ihl], 0) != 0 {
        return Err(PacketError::Checksum("ipv4"));
    }

    let src = IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]));
    parse_transport(buf[9], src, dst, &buf[ihl..total], verify)
}

fn parse_ipv6(buf: &[u8], verify: bool) -> Result<Packet<'_>, PacketError> {
    need(buf, IPV6_HEADER_LEN)?;
    let end = IPV6_HEADER_LEN + be16(buf, 4) as usize;
    need(buf, end)?;

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&buf[8..24]);
    dst.copy_from_slice(&buf[24..40]);

    let mut next = buf[6];
    let mut offset = IPV6_HEADER_LEN;
    loop {
        match next {
            PROTO_TCP | PROTO_UDP => break,
            // hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                need(&buf[..end], offset + 2)?;
                let len = (buf[offset + 1] as usize + 1) * 8;
                need(&buf[..end], offset + len)?;
                next = buf[offset];
                offset += len;
            }
            44 => return Err(PacketError::Fragmented),
            other => return Err(PacketError::UnsupportedProtocol(other)),
        }
    }

    parse_transport(
        next,
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
        &buf[offset..end],
        verify,
    )
}

fn parse_transport<'a>(
    proto: u8,
    src: IpAddr,
    dst: IpAddr,
    seg: &'a [u8],
    verify: bool,
) -> Result<Packet<'a>, PacketError> {
    match proto {
        PROTO_TCP => {
            need(seg, TCP_HEADER_LEN)?;
            let off = ((seg[12] >> 4) as usize) * 4;
            if off < TCP_HEADER_LEN {
                return Err(PacketError::InvalidHeader("tcp data offset"));
            }
            need(seg, off)?;
            if verify && checksum(seg, pseudo_header_sum(src, dst, PROTO_TCP, seg.len())) != 0 {
                return Err(PacketError::Checksum("tcp"));
            }
            let segment = TcpSegment {
                seq: be32(seg, 4),
                ack: be32(seg, 8),
                flags: TcpFlags(seg[13] & 0x3f),
                window: be16(seg, 14),
                mss: parse_mss(&seg[TCP_HEADER_LEN..off]),
                payload: &seg[off..],
            };
            Ok(Packet {
                src: SocketAddr::new(src, be16(seg, 0)),
                dst: SocketAddr::new(dst, be16(seg, 2)),
                transport: Transport::Tcp(segment),
            })
        }
        PROTO_UDP => {
            need(seg, UDP_HEADER_LEN)?;
            let len = be16(seg, 4) as usize;
            if len < UDP_HEADER_LEN || len > seg.len() {
                return Err(PacketError::InvalidHeader("udp length"));
            }
            let sum = be16(seg, 6);
            // A zero UDP checksum over IPv4 means none was computed.
            let skip = sum == 0 && src.is_ipv4();
            if verify && !skip && checksum(&seg[..len], pseudo_header_sum(src, dst, PROTO_UDP, len)) != 0
            {
                return Err(PacketError::Checksum("udp"));
            }
            Ok(Packet {
                src: SocketAddr::new(src, be16(seg, 0)),
                dst: SocketAddr::new(dst, be16(seg, 2)),
                transport: Transport::Udp(&seg[UDP_HEADER_LEN..len]),
            })
        }
        other => Err(PacketError::UnsupportedProtocol(other)),
    }
}

fn parse_mss(mut opts: &[u8]) -> Option<u16> {
    while let [kind, rest @ ..] = opts {
        match *kind {
            0 => return None,
            1 => opts = rest,
            _ => {
                let len = *rest.first()? as usize;
                if len < 2 || len > opts.len() {
                    return None;
                }
                if *kind == TCP_OPT_MSS && len == 4 {
                    return Some(be16(opts, 2));
                }
                opts = &opts[len..];
            }
        }
    }
    None
}

fn sum_words(data: &[u8], mut acc: u64) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u64) << 8;
    }
    acc
}

/// Internet checksum of `data` seeded with `initial`
///
/// Over a buffer that already holds a correct checksum the result is zero.
pub fn checksum(data: &[u8], initial: u64) -> u16 {
    let mut acc = sum_words(data, initial);
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    !(acc as u16)
}

fn pseudo_header_sum(src: IpAddr, dst: IpAddr, proto: u8, len: usize) -> u64 {
    let mut acc = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => sum_words(&d.octets(), sum_words(&s.octets(), 0)),
        (s, d) => sum_words(&v6(d).octets(), sum_words(&v6(s).octets(), 0)),
    };
    acc += proto as u64;
    acc += len as u64;
    acc
}

fn v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn ip_header(src: IpAddr, dst: IpAddr, proto: u8, payload_len: usize) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total = (IPV4_HEADER_LEN + payload_len) as u16;
            let mut hdr = Vec::with_capacity(IPV4_HEADER_LEN + payload_len);
            hdr.extend_from_slice(&[0x45, 0]);
            hdr.extend_from_slice(&total.to_be_bytes());
            // id 0, don't fragment
            hdr.extend_from_slice(&[0, 0, 0x40, 0, DEFAULT_TTL, proto, 0, 0]);
            hdr.extend_from_slice(&s.octets());
            hdr.extend_from_slice(&d.octets());
            let sum = checksum(&hdr, 0);
            hdr[10..12].copy_from_slice(&sum.to_be_bytes());
            hdr
        }
        (s, d) => {
            let mut hdr = Vec::with_capacity(IPV6_HEADER_LEN + payload_len);
            hdr.extend_from_slice(&[0x60, 0, 0, 0]);
            hdr.extend_from_slice(&(payload_len as u16).to_be_bytes());
            hdr.extend_from_slice(&[proto, DEFAULT_TTL]);
            hdr.extend_from_slice(&v6(s).octets());
            hdr.extend_from_slice(&v6(d).octets());
            hdr
        }
    }
}

fn finish(src: IpAddr, dst: IpAddr, proto: u8, mut seg: Vec<u8>, sum_at: usize) -> Vec<u8> {
    let mut sum = checksum(&seg, pseudo_header_sum(src, dst, proto, seg.len()));
    if proto == PROTO_UDP && sum == 0 {
        sum = 0xffff;
    }
    seg[sum_at..sum_at + 2].copy_from_slice(&sum.to_be_bytes());
    let mut packet = ip_header(src, dst, proto, seg.len());
    packet.extend_from_slice(&seg);
    packet
}

/// Fields of a TCP segment to build
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
}

/// Build a complete IP packet carrying one TCP segment
pub fn build_tcp(header: &TcpHeader, payload: &[u8]) -> Vec<u8> {
    let opt_len = if header.mss.is_some() { 4 } else { 0 };
    let hdr_len = TCP_HEADER_LEN + opt_len;
    let mut seg = Vec::with_capacity(hdr_len + payload.len());
    seg.extend_from_slice(&header.src.port().to_be_bytes());
    seg.extend_from_slice(&header.dst.port().to_be_bytes());
    seg.extend_from_slice(&header.seq.to_be_bytes());
    seg.extend_from_slice(&header.ack.to_be_bytes());
    seg.push(((hdr_len / 4) as u8) << 4);
    seg.push(header.flags.0);
    seg.extend_from_slice(&header.window.to_be_bytes());
    // checksum, urgent pointer
    seg.extend_from_slice(&[0, 0, 0, 0]);
    if let Some(mss) = header.mss {
        seg.extend_from_slice(&[TCP_OPT_MSS, 4]);
        seg.extend_from_slice(&mss.to_be_bytes());
    }
    seg.extend_from_slice(payload);
    finish(header.src.ip(), header.dst.ip(), PROTO_TCP, seg, 16)
}

/// Build a complete IP packet carrying one UDP datagram
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let len = (UDP_HEADER_LEN + payload.len()) as u16;
    let mut seg = Vec::with_capacity(len as usize);
    seg.extend_from_slice(&src.port().to_be_bytes());
    seg.extend_from_slice(&dst.port().to_be_bytes());
    seg.extend_from_slice(&len.to_be_bytes());
    seg.extend_from_slice(&[0, 0]);
    seg.extend_from_slice(payload);
    finish(src.ip(), dst.ip(), PROTO_UDP, seg, 6)
}

/// IP plus transport header overhead for a family
pub fn header_overhead(ip: &IpAddr, proto: u8) -> usize {
    let ip_len = if ip.is_ipv4() { IPV4_HEADER_LEN } else { IPV6_HEADER_LEN };
    let tp_len = if proto == PROTO_TCP { TCP_HEADER_LEN } else { UDP_HEADER_LEN };
    ip_len + tp_len
}
