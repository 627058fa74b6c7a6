use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed IPv4 header")]
    MalformedV4,
    #[error("malformed IPv6 header")]
    MalformedV6,
    #[error("truncated transport header")]
    TruncatedTransport,
    #[error("address family mismatch")]
    FamilyMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Icmp,
    Tcp,
    Udp,
    IcmpV6,
    Other(u8),
}

impl TransportProtocol {
    pub fn from_value(v: u8) -> Self {
        match v {
            1 => TransportProtocol::Icmp,
            6 => TransportProtocol::Tcp,
            17 => TransportProtocol::Udp,
            58 => TransportProtocol::IcmpV6,
            other => TransportProtocol::Other(other),
        }
    }

    pub fn value(self) -> u8 {
        match self {
            TransportProtocol::Icmp => 1,
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::IcmpV6 => 58,
            TransportProtocol::Other(v) => v,
        }
    }

    pub fn is_icmp(self) -> bool {
        matches!(self, TransportProtocol::Icmp | TransportProtocol::IcmpV6)
    }
}

pub const ICMP_V4_ECHO_REPLY: u8 = 0;
pub const ICMP_V4_UNREACHABLE: u8 = 3;
pub const ICMP_V4_UNREACHABLE_FRAG_NEEDED: u8 = 4;
pub const ICMP_V4_ECHO_REQUEST: u8 = 8;
pub const ICMP_V6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP_V6_ECHO_REQUEST: u8 = 128;
pub const ICMP_V6_ECHO_REPLY: u8 = 129;
/// Neighbor/router discovery range (RS/RA/NS/NA/redirect); dropped by the
/// client instead of tunneled.
pub const ICMP_V6_ND_FIRST: u8 = 133;
pub const ICMP_V6_ND_LAST: u8 = 137;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// An owned, mutable IP packet. Parsing validates only as far as the fields
/// this crate reads; setters keep the IP and transport checksums coherent.
#[derive(Clone)]
pub struct IpPacket {
    buf: BytesMut,
    version: IpVersion,
    header_len: usize,
    protocol: TransportProtocol,
}

impl std::fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpPacket")
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .field("source", &self.source())
            .field("destination", &self.destination())
            .field("len", &self.buf.len())
            .finish()
    }
}

impl IpPacket {
    pub fn parse(data: impl Into<BytesMut>) -> Result<Self, PacketError> {
        let buf: BytesMut = data.into();
        if buf.is_empty() {
            return Err(PacketError::Empty);
        }
        match buf[0] >> 4 {
            4 => {
                if buf.len() < IPV4_MIN_HEADER {
                    return Err(PacketError::MalformedV4);
                }
                let header_len = ((buf[0] & 0x0f) as usize) * 4;
                if header_len < IPV4_MIN_HEADER || buf.len() < header_len {
                    return Err(PacketError::MalformedV4);
                }
                let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if total_len > buf.len() || total_len < header_len {
                    return Err(PacketError::MalformedV4);
                }
                let protocol = TransportProtocol::from_value(buf[9]);
                Ok(Self {
                    buf,
                    version: IpVersion::V4,
                    header_len,
                    protocol,
                })
            }
            6 => {
                if buf.len() < IPV6_HEADER {
                    return Err(PacketError::MalformedV6);
                }
                // Extension headers are not walked; the next-header value is
                // treated as the transport protocol.
                let protocol = TransportProtocol::from_value(buf[6]);
                Ok(Self {
                    buf,
                    version: IpVersion::V6,
                    header_len: IPV6_HEADER,
                    protocol,
                })
            }
            v => Err(PacketError::UnsupportedVersion(v)),
        }
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    pub fn source(&self) -> IpAddr {
        match self.version {
            IpVersion::V4 => {
                IpAddr::V4(Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15]))
            }
            IpVersion::V6 => IpAddr::V6(read_v6(&self.buf[8..24])),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self.version {
            IpVersion::V4 => {
                IpAddr::V4(Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19]))
            }
            IpVersion::V6 => IpAddr::V6(read_v6(&self.buf[24..40])),
        }
    }

    /// True for IPv4 with the DF bit set; IPv6 never fragments in flight.
    pub fn dont_fragment(&self) -> bool {
        match self.version {
            IpVersion::V4 => self.buf[6] & 0x40 != 0,
            IpVersion::V6 => true,
        }
    }

    fn transport(&self) -> &[u8] {
        &self.buf[self.header_len..]
    }

    pub fn source_port(&self) -> Option<u16> {
        match self.protocol {
            TransportProtocol::Tcp | TransportProtocol::Udp => {
                let t = self.transport();
                (t.len() >= 4).then(|| u16::from_be_bytes([t[0], t[1]]))
            }
            _ => None,
        }
    }

    pub fn destination_port(&self) -> Option<u16> {
        match self.protocol {
            TransportProtocol::Tcp | TransportProtocol::Udp => {
                let t = self.transport();
                (t.len() >= 4).then(|| u16::from_be_bytes([t[2], t[3]]))
            }
            _ => None,
        }
    }

    pub fn source_endpoint(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.source(), self.source_port()?))
    }

    pub fn destination_endpoint(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.destination(), self.destination_port()?))
    }

    pub fn icmp_type(&self) -> Option<u8> {
        if !self.protocol.is_icmp() {
            return None;
        }
        self.transport().first().copied()
    }

    /// Identifier of an ICMP echo request/reply.
    pub fn icmp_echo_id(&self) -> Option<u16> {
        let t = self.transport();
        if !self.protocol.is_icmp() || t.len() < 8 {
            return None;
        }
        match (self.protocol, t[0]) {
            (TransportProtocol::Icmp, ICMP_V4_ECHO_REQUEST | ICMP_V4_ECHO_REPLY)
            | (TransportProtocol::IcmpV6, ICMP_V6_ECHO_REQUEST | ICMP_V6_ECHO_REPLY) => {
                Some(u16::from_be_bytes([t[4], t[5]]))
            }
            _ => None,
        }
    }

    pub fn is_icmp_echo_request(&self) -> bool {
        matches!(
            (self.protocol, self.icmp_type()),
            (TransportProtocol::Icmp, Some(ICMP_V4_ECHO_REQUEST))
                | (TransportProtocol::IcmpV6, Some(ICMP_V6_ECHO_REQUEST))
        )
    }

    /// Neighbor/router discovery messages never leave the device.
    pub fn is_ipv6_discovery(&self) -> bool {
        matches!(
            (self.protocol, self.icmp_type()),
            (TransportProtocol::IcmpV6, Some(t)) if (ICMP_V6_ND_FIRST..=ICMP_V6_ND_LAST).contains(&t)
        )
    }

    /// UDP payload after the transport header.
    pub fn udp_payload(&self) -> Option<&[u8]> {
        if self.protocol != TransportProtocol::Udp {
            return None;
        }
        let t = self.transport();
        (t.len() >= 8).then(|| &t[8..])
    }

    /// ICMP message starting at its type byte (what a kernel ping socket
    /// sends and receives).
    pub fn icmp_message(&self) -> Option<&[u8]> {
        if !self.protocol.is_icmp() {
            return None;
        }
        let t = self.transport();
        (t.len() >= 8).then_some(t)
    }

    pub fn set_source(&mut self, addr: IpAddr) -> Result<(), PacketError> {
        self.set_addr(addr, true)
    }

    pub fn set_destination(&mut self, addr: IpAddr) -> Result<(), PacketError> {
        self.set_addr(addr, false)
    }

    fn set_addr(&mut self, addr: IpAddr, source: bool) -> Result<(), PacketError> {
        match (self.version, addr) {
            (IpVersion::V4, IpAddr::V4(a)) => {
                let off = if source { 12 } else { 16 };
                self.buf[off..off + 4].copy_from_slice(&a.octets());
            }
            (IpVersion::V6, IpAddr::V6(a)) => {
                let off = if source { 8 } else { 24 };
                self.buf[off..off + 16].copy_from_slice(&a.octets());
            }
            _ => return Err(PacketError::FamilyMismatch),
        }
        self.refresh_checksums();
        Ok(())
    }

    pub fn set_source_port(&mut self, port: u16) -> Result<(), PacketError> {
        self.set_port(port, 0)
    }

    pub fn set_destination_port(&mut self, port: u16) -> Result<(), PacketError> {
        self.set_port(port, 2)
    }

    fn set_port(&mut self, port: u16, offset: usize) -> Result<(), PacketError> {
        if !matches!(
            self.protocol,
            TransportProtocol::Tcp | TransportProtocol::Udp
        ) {
            return Err(PacketError::TruncatedTransport);
        }
        let base = self.header_len + offset;
        if self.buf.len() < base + 2 {
            return Err(PacketError::TruncatedTransport);
        }
        self.buf[base..base + 2].copy_from_slice(&port.to_be_bytes());
        self.refresh_checksums();
        Ok(())
    }

    pub fn set_icmp_echo_id(&mut self, id: u16) -> Result<(), PacketError> {
        if self.icmp_echo_id().is_none() {
            return Err(PacketError::TruncatedTransport);
        }
        let base = self.header_len + 4;
        self.buf[base..base + 2].copy_from_slice(&id.to_be_bytes());
        self.refresh_checksums();
        Ok(())
    }

    fn refresh_checksums(&mut self) {
        if self.version == IpVersion::V4 {
            self.buf[10] = 0;
            self.buf[11] = 0;
            let sum = internet_checksum(&[&self.buf[..self.header_len]]);
            self.buf[10..12].copy_from_slice(&sum.to_be_bytes());
        }

        let csum_off = match self.protocol {
            TransportProtocol::Udp => Some(self.header_len + 6),
            TransportProtocol::Tcp => Some(self.header_len + 16),
            TransportProtocol::Icmp | TransportProtocol::IcmpV6 => Some(self.header_len + 2),
            TransportProtocol::Other(_) => None,
        };
        let Some(off) = csum_off else { return };
        if self.buf.len() < off + 2 {
            return;
        }

        self.buf[off] = 0;
        self.buf[off + 1] = 0;

        let transport_len = self.buf.len() - self.header_len;
        let sum = match (self.version, self.protocol) {
            // ICMPv4 checksums only its own message.
            (IpVersion::V4, TransportProtocol::Icmp) => {
                internet_checksum(&[&self.buf[self.header_len..]])
            }
            (IpVersion::V4, _) => {
                let pseudo = pseudo_v4(
                    &self.buf[12..16],
                    &self.buf[16..20],
                    self.protocol.value(),
                    transport_len,
                );
                internet_checksum(&[&pseudo, &self.buf[self.header_len..]])
            }
            (IpVersion::V6, _) => {
                let pseudo = pseudo_v6(
                    &self.buf[8..24],
                    &self.buf[24..40],
                    self.protocol.value(),
                    transport_len,
                );
                internet_checksum(&[&pseudo, &self.buf[self.header_len..]])
            }
        };
        // UDP transmits an all-zero checksum as 0xffff.
        let sum = if self.protocol == TransportProtocol::Udp && sum == 0 {
            0xffff
        } else {
            sum
        };
        self.buf[off..off + 2].copy_from_slice(&sum.to_be_bytes());
    }
}

fn read_v6(b: &[u8]) -> Ipv6Addr {
    let mut o = [0u8; 16];
    o.copy_from_slice(b);
    Ipv6Addr::from(o)
}

fn pseudo_v4(src: &[u8], dst: &[u8], proto: u8, len: usize) -> Vec<u8> {
    let mut p = Vec::with_capacity(12);
    p.extend_from_slice(src);
    p.extend_from_slice(dst);
    p.push(0);
    p.push(proto);
    p.extend_from_slice(&(len as u16).to_be_bytes());
    p
}

fn pseudo_v6(src: &[u8], dst: &[u8], proto: u8, len: usize) -> Vec<u8> {
    let mut p = Vec::with_capacity(40);
    p.extend_from_slice(src);
    p.extend_from_slice(dst);
    p.extend_from_slice(&(len as u32).to_be_bytes());
    p.extend_from_slice(&[0, 0, 0, proto]);
    p
}

/// RFC 1071 ones'-complement sum over the concatenation of `parts`.
fn internet_checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut carry: Option<u8> = None;
    for part in parts {
        for &b in part.iter() {
            match carry.take() {
                None => carry = Some(b),
                Some(hi) => sum += u32::from(u16::from_be_bytes([hi, b])),
            }
        }
    }
    if let Some(hi) = carry {
        sum += u32::from(u16::from_be_bytes([hi, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn build_v4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: TransportProtocol,
    transport: &[u8],
) -> IpPacket {
    let total = IPV4_MIN_HEADER + transport.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total as u16);
    buf.put_u16(rand::random::<u16>()); // identification
    buf.put_u16(0); // flags + fragment offset
    buf.put_u8(64); // ttl
    buf.put_u8(protocol.value());
    buf.put_u16(0); // header checksum, fixed up below
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());
    buf.put_slice(transport);
    let mut p = IpPacket::parse(buf).expect("constructed packet is valid");
    p.refresh_checksums();
    p
}

fn build_v6(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    protocol: TransportProtocol,
    transport: &[u8],
) -> IpPacket {
    let mut buf = BytesMut::with_capacity(IPV6_HEADER + transport.len());
    buf.put_u32(6 << 28);
    buf.put_u16(transport.len() as u16);
    buf.put_u8(protocol.value());
    buf.put_u8(64); // hop limit
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());
    buf.put_slice(transport);
    let mut p = IpPacket::parse(buf).expect("constructed packet is valid");
    p.refresh_checksums();
    p
}

/// Splits a buffer holding back-to-back IP packets (as packed into one
/// sealed datagram) using each packet's declared length.
pub fn split_packets(data: &[u8]) -> Result<Vec<IpPacket>, PacketError> {
    let mut out = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let declared = match rest[0] >> 4 {
            4 => {
                if rest.len() < 4 {
                    return Err(PacketError::MalformedV4);
                }
                u16::from_be_bytes([rest[2], rest[3]]) as usize
            }
            6 => {
                if rest.len() < 6 {
                    return Err(PacketError::MalformedV6);
                }
                IPV6_HEADER + u16::from_be_bytes([rest[4], rest[5]]) as usize
            }
            v => return Err(PacketError::UnsupportedVersion(v)),
        };
        if declared == 0 || declared > rest.len() {
            return Err(PacketError::TruncatedTransport);
        }
        out.push(IpPacket::parse(&rest[..declared])?);
        rest = &rest[declared..];
    }
    Ok(out)
}

/// Builds a UDP/IP packet. Source and destination must share a family.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<IpPacket, PacketError> {
    let udp_len = 8 + payload.len();
    let mut t = Vec::with_capacity(udp_len);
    t.extend_from_slice(&src.port().to_be_bytes());
    t.extend_from_slice(&dst.port().to_be_bytes());
    t.extend_from_slice(&(udp_len as u16).to_be_bytes());
    t.extend_from_slice(&[0, 0]);
    t.extend_from_slice(payload);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => Ok(build_v4(s, d, TransportProtocol::Udp, &t)),
        (IpAddr::V6(s), IpAddr::V6(d)) => Ok(build_v6(s, d, TransportProtocol::Udp, &t)),
        _ => Err(PacketError::FamilyMismatch),
    }
}

/// Wraps a raw ICMP message (starting at its type byte) into an IP packet.
pub fn build_icmp(src: IpAddr, dst: IpAddr, message: &[u8]) -> Result<IpPacket, PacketError> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => Ok(build_v4(s, d, TransportProtocol::Icmp, message)),
        (IpAddr::V6(s), IpAddr::V6(d)) => Ok(build_v6(s, d, TransportProtocol::IcmpV6, message)),
        _ => Err(PacketError::FamilyMismatch),
    }
}

/// Builds the MTU-discovery reply for an oversize don't-fragment packet:
/// ICMPv4 "fragmentation needed" or ICMPv6 "packet too big", embedding the
/// original header plus eight payload bytes, addressed back to the sender.
pub fn build_packet_too_big(original: &IpPacket, mtu: u16) -> Result<IpPacket, PacketError> {
    let embed_len = (original.header_len + 8).min(original.len());
    let embedded = &original.as_bytes()[..embed_len];

    match original.version() {
        IpVersion::V4 => {
            let mut msg = Vec::with_capacity(8 + embedded.len());
            msg.push(ICMP_V4_UNREACHABLE);
            msg.push(ICMP_V4_UNREACHABLE_FRAG_NEEDED);
            msg.extend_from_slice(&[0, 0]); // checksum
            msg.extend_from_slice(&[0, 0]); // unused
            msg.extend_from_slice(&mtu.to_be_bytes());
            msg.extend_from_slice(embedded);
            build_icmp(original.destination(), original.source(), &msg)
        }
        IpVersion::V6 => {
            let mut msg = Vec::with_capacity(8 + embedded.len());
            msg.push(ICMP_V6_PACKET_TOO_BIG);
            msg.push(0);
            msg.extend_from_slice(&[0, 0]); // checksum
            msg.extend_from_slice(&u32::from(mtu).to_be_bytes());
            msg.extend_from_slice(embedded);
            build_icmp(original.destination(), original.source(), &msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    #[test]
    fn udp_build_and_parse() {
        let p = build_udp(v4(10, 0, 0, 1, 5000), v4(8, 8, 8, 8, 53), b"query").unwrap();
        assert_eq!(p.version(), IpVersion::V4);
        assert_eq!(p.protocol(), TransportProtocol::Udp);
        assert_eq!(p.source_endpoint(), Some(v4(10, 0, 0, 1, 5000)));
        assert_eq!(p.destination_endpoint(), Some(v4(8, 8, 8, 8, 53)));
        assert_eq!(p.udp_payload(), Some(&b"query"[..]));
        assert!(!p.dont_fragment());
    }

    #[test]
    fn checksums_survive_rewrite() {
        let mut p = build_udp(v4(10, 0, 0, 1, 5000), v4(8, 8, 8, 8, 53), b"abc").unwrap();
        let ip_sum_before = u16::from_be_bytes([p.as_bytes()[10], p.as_bytes()[11]]);
        p.set_destination(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))).unwrap();
        p.set_destination_port(5353).unwrap();

        let ip_sum_after = u16::from_be_bytes([p.as_bytes()[10], p.as_bytes()[11]]);
        assert_ne!(ip_sum_before, ip_sum_after);
        assert_eq!(p.destination_endpoint(), Some(v4(1, 1, 1, 1, 5353)));

        // Header checksum must verify: summing the header including the
        // stored checksum yields zero.
        let hdr = &p.as_bytes()[..20];
        let mut sum = 0u32;
        for ch in hdr.chunks(2) {
            sum += u32::from(u16::from_be_bytes([ch[0], ch[1]]));
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xffff);
    }

    #[test]
    fn v6_udp_roundtrip() {
        let src = SocketAddr::new("fd00::1".parse().unwrap(), 1000);
        let dst = SocketAddr::new("fd00::2".parse().unwrap(), 2000);
        let p = build_udp(src, dst, b"x").unwrap();
        assert_eq!(p.version(), IpVersion::V6);
        assert_eq!(p.source_endpoint(), Some(src));
        assert_eq!(p.destination_endpoint(), Some(dst));
        assert!(p.dont_fragment());
    }

    #[test]
    fn family_mismatch_rejected() {
        let src = v4(10, 0, 0, 1, 1);
        let dst = SocketAddr::new("fd00::2".parse().unwrap(), 2);
        assert!(matches!(
            build_udp(src, dst, b""),
            Err(PacketError::FamilyMismatch)
        ));
    }

    #[test]
    fn packet_too_big_addresses_sender() {
        let p = build_udp(v4(10, 0, 0, 1, 5000), v4(8, 8, 8, 8, 53), &[0u8; 64]).unwrap();
        let reply = build_packet_too_big(&p, 1400).unwrap();
        assert_eq!(reply.source(), p.destination());
        assert_eq!(reply.destination(), p.source());
        assert_eq!(reply.icmp_type(), Some(ICMP_V4_UNREACHABLE));
        let msg = reply.icmp_message().unwrap();
        assert_eq!(msg[1], ICMP_V4_UNREACHABLE_FRAG_NEEDED);
        assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 1400);
        // The embedded original starts right after the 8-byte ICMP header.
        assert_eq!(&msg[8..12], &p.as_bytes()[..4]);
    }

    #[test]
    fn echo_id_rewrite() {
        let mut msg = vec![ICMP_V4_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0, 1];
        msg.extend_from_slice(b"ping");
        let mut p = build_icmp(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            &msg,
        )
        .unwrap();
        assert!(p.is_icmp_echo_request());
        assert_eq!(p.icmp_echo_id(), Some(0x1234));
        p.set_icmp_echo_id(0xbeef).unwrap();
        assert_eq!(p.icmp_echo_id(), Some(0xbeef));
    }

    #[test]
    fn ipv6_discovery_detected() {
        let msg = [135u8, 0, 0, 0, 0, 0, 0, 0]; // neighbor solicitation
        let p = build_icmp(
            "fe80::1".parse().unwrap(),
            "ff02::1".parse().unwrap(),
            &msg,
        )
        .unwrap();
        assert!(p.is_ipv6_discovery());
        assert!(!p.is_icmp_echo_request());
    }

    #[test]
    fn split_packets_by_declared_length() {
        let a = build_udp(v4(10, 0, 0, 1, 1), v4(8, 8, 8, 8, 53), b"aa").unwrap();
        let b = build_udp(v4(10, 0, 0, 2, 2), v4(9, 9, 9, 9, 443), b"bbbb").unwrap();
        let mut joined = Vec::new();
        joined.extend_from_slice(a.as_bytes());
        joined.extend_from_slice(b.as_bytes());

        let parts = split_packets(&joined).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].udp_payload(), Some(&b"aa"[..]));
        assert_eq!(parts[1].udp_payload(), Some(&b"bbbb"[..]));

        assert!(split_packets(&joined[..joined.len() - 1]).is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(IpPacket::parse(&b""[..]), Err(PacketError::Empty)));
        assert!(matches!(
            IpPacket::parse(&[0x45u8, 0, 0][..]),
            Err(PacketError::MalformedV4)
        ));
        assert!(matches!(
            IpPacket::parse(&[0x10u8; 40][..]),
            Err(PacketError::UnsupportedVersion(1))
        ));
    }
}
