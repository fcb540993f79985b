use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

use crate::buffer::PooledBuffer;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Offset of the payload in a packet built by [`write_tcp_segment`] without options.
pub const TCP_PAYLOAD_OFFSET: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;
/// Offset of the payload in a packet built by [`write_udp_datagram`].
pub const UDP_PAYLOAD_OFFSET: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
const TCP_OPT_MSS: u8 = 2;
const TCP_OPT_MSS_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("inconsistent header: {0}")]
    Inconsistent(&'static str),
    #[error("fragmented datagrams are not supported")]
    Fragmented,
    #[error("unsupported IP version: {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(u8),
}

impl PacketError {
    /// True for errors caused by a truncated or self-contradicting packet.
    pub fn is_malformed(&self) -> bool {
        matches!(self, PacketError::TooShort { .. } | PacketError::Inconsistent(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    fn number(self) -> u8 {
        match self {
            TransportProtocol::Tcp => PROTO_TCP,
            TransportProtocol::Udp => PROTO_UDP,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => f.write_str("tcp"),
            TransportProtocol::Udp => f.write_str("udp"),
        }
    }
}

/// TCP control bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

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

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 5] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Parsed IPv4 header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub identification: u16,
    pub ttl: u8,
    pub protocol: TransportProtocol,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// UDP length field (header + payload).
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

/// Header information of one IPv4 datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeaders {
    pub ip: Ipv4Header,
    pub transport: TransportHeader,
}

impl PacketHeaders {
    pub fn payload_offset(&self) -> usize {
        self.ip.header_len
            + match self.transport {
                TransportHeader::Tcp(tcp) => tcp.header_len,
                TransportHeader::Udp(_) => UDP_HEADER_LEN,
            }
    }

    pub fn payload_len(&self) -> usize {
        match self.transport {
            TransportHeader::Tcp(tcp) => self.ip.total_len - self.ip.header_len - tcp.header_len,
            TransportHeader::Udp(udp) => udp.length - UDP_HEADER_LEN,
        }
    }

    pub fn src_port(&self) -> u16 {
        match self.transport {
            TransportHeader::Tcp(tcp) => tcp.src_port,
            TransportHeader::Udp(udp) => udp.src_port,
        }
    }

    pub fn dst_port(&self) -> u16 {
        match self.transport {
            TransportHeader::Tcp(tcp) => tcp.dst_port,
            TransportHeader::Udp(udp) => udp.dst_port,
        }
    }
}

/// Parse an IPv4 TCP/UDP datagram.
pub fn parse(data: &[u8]) -> Result<PacketHeaders, PacketError> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(PacketError::TooShort {
            expected: IPV4_HEADER_LEN,
            actual: data.len(),
        });
    }

    let version = data[0] >> 4;
    if version != 4 {
        return Err(PacketError::UnsupportedVersion(version));
    }

    let header_len = (data[0] & 0x0F) as usize * 4;
    if header_len < IPV4_HEADER_LEN {
        return Err(PacketError::Inconsistent("IHL below minimum"));
    }
    if header_len > data.len() {
        return Err(PacketError::Inconsistent("IHL exceeds buffer"));
    }

    let total_len = read_u16(data, 2) as usize;
    if total_len < header_len {
        return Err(PacketError::Inconsistent("total length shorter than header"));
    }
    if total_len > data.len() {
        return Err(PacketError::TooShort {
            expected: total_len,
            actual: data.len(),
        });
    }

    let frag = read_u16(data, 6);
    if frag & FLAG_MORE_FRAGMENTS != 0 || frag & FRAGMENT_OFFSET_MASK != 0 {
        return Err(PacketError::Fragmented);
    }

    let protocol = match data[9] {
        PROTO_TCP => TransportProtocol::Tcp,
        PROTO_UDP => TransportProtocol::Udp,
        other => return Err(PacketError::UnsupportedProtocol(other)),
    };

    let ip = Ipv4Header {
        header_len,
        total_len,
        identification: read_u16(data, 4),
        ttl: data[8],
        protocol,
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
    };

    let segment = &data[header_len..total_len];
    let transport = match protocol {
        TransportProtocol::Tcp => TransportHeader::Tcp(parse_tcp(segment, total_len)?),
        TransportProtocol::Udp => TransportHeader::Udp(parse_udp(segment, total_len)?),
    };

    Ok(PacketHeaders { ip, transport })
}

fn parse_tcp(segment: &[u8], total_len: usize) -> Result<TcpHeader, PacketError> {
    if segment.len() < TCP_HEADER_LEN {
        return Err(PacketError::TooShort {
            expected: total_len - segment.len() + TCP_HEADER_LEN,
            actual: total_len,
        });
    }

    let header_len = (segment[12] >> 4) as usize * 4;
    if header_len < TCP_HEADER_LEN || header_len > segment.len() {
        return Err(PacketError::Inconsistent("TCP data offset out of range"));
    }

    Ok(TcpHeader {
        src_port: read_u16(segment, 0),
        dst_port: read_u16(segment, 2),
        seq: read_u32(segment, 4),
        ack: read_u32(segment, 8),
        header_len,
        flags: TcpFlags(segment[13] & 0x3F),
        window: read_u16(segment, 14),
    })
}

fn parse_udp(segment: &[u8], total_len: usize) -> Result<UdpHeader, PacketError> {
    if segment.len() < UDP_HEADER_LEN {
        return Err(PacketError::TooShort {
            expected: total_len - segment.len() + UDP_HEADER_LEN,
            actual: total_len,
        });
    }

    let length = read_u16(segment, 4) as usize;
    if length < UDP_HEADER_LEN || length > segment.len() {
        return Err(PacketError::Inconsistent("UDP length out of range"));
    }

    Ok(UdpHeader {
        src_port: read_u16(segment, 0),
        dst_port: read_u16(segment, 2),
        length,
    })
}

/// One parsed datagram together with the pooled buffer holding it.
pub struct Packet {
    buffer: PooledBuffer,
    headers: PacketHeaders,
}

impl Packet {
    /// Wrap a buffer whose contents were already parsed into `headers`.
    pub fn new(buffer: PooledBuffer, headers: PacketHeaders) -> Self {
        Self { buffer, headers }
    }

    /// Parse the buffer, handing it back on failure so it can be reused.
    pub fn from_buffer(buffer: PooledBuffer) -> Result<Self, (PacketError, PooledBuffer)> {
        match parse(&buffer) {
            Ok(headers) => Ok(Self { buffer, headers }),
            Err(e) => Err((e, buffer)),
        }
    }

    pub fn headers(&self) -> &PacketHeaders {
        &self.headers
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.headers.ip.protocol
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol() == TransportProtocol::Tcp
    }

    pub fn is_udp(&self) -> bool {
        self.protocol() == TransportProtocol::Udp
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.headers.transport {
            TransportHeader::Tcp(tcp) => Some(tcp),
            TransportHeader::Udp(_) => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.headers.transport {
            TransportHeader::Udp(udp) => Some(udp),
            TransportHeader::Tcp(_) => None,
        }
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        self.headers.ip.src
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        self.headers.ip.dst
    }

    pub fn src_port(&self) -> u16 {
        self.headers.src_port()
    }

    pub fn dst_port(&self) -> u16 {
        self.headers.dst_port()
    }

    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_addr(), self.src_port())
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_addr(), self.dst_port())
    }

    pub fn payload_offset(&self) -> usize {
        self.headers.payload_offset()
    }

    pub fn payload(&self) -> &[u8] {
        let offset = self.payload_offset();
        &self.buffer[offset..offset + self.headers.payload_len()]
    }

    /// Writable area from the payload start to the end of the buffer's capacity.
    pub fn payload_capacity_mut(&mut self) -> &mut [u8] {
        let offset = self.payload_offset();
        &mut self.buffer.spare_mut()[offset..]
    }

    /// The datagram bytes as declared by the IPv4 total length.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.headers.ip.total_len]
    }

    /// Exchange source and destination address and port.
    pub fn swap(&mut self) {
        let ihl = self.headers.ip.header_len;
        let buf = self.buffer.spare_mut();

        for i in 0..4 {
            buf.swap(12 + i, 16 + i);
        }
        buf.swap(ihl, ihl + 2);
        buf.swap(ihl + 1, ihl + 3);

        let ip = &mut self.headers.ip;
        std::mem::swap(&mut ip.src, &mut ip.dst);
        match &mut self.headers.transport {
            TransportHeader::Tcp(tcp) => std::mem::swap(&mut tcp.src_port, &mut tcp.dst_port),
            TransportHeader::Udp(udp) => std::mem::swap(&mut udp.src_port, &mut udp.dst_port),
        }
    }

    /// Resize the payload, updating the IPv4 total length and UDP length fields.
    ///
    /// The new payload bytes must already be in place (see [`Packet::payload_capacity_mut`]).
    pub fn set_payload_len(&mut self, len: usize) -> Result<(), PacketError> {
        let offset = self.payload_offset();
        let total_len = offset + len;
        if total_len > self.buffer.capacity() || total_len > u16::MAX as usize {
            return Err(PacketError::Inconsistent("payload exceeds buffer capacity"));
        }

        let ihl = self.headers.ip.header_len;
        self.buffer.set_len(total_len);
        let buf = self.buffer.spare_mut();
        write_u16(buf, 2, total_len as u16);
        self.headers.ip.total_len = total_len;

        if let TransportHeader::Udp(udp) = &mut self.headers.transport {
            udp.length = UDP_HEADER_LEN + len;
            write_u16(buf, ihl + 4, udp.length as u16);
        }
        Ok(())
    }

    pub fn set_tcp_seq(&mut self, seq: u32) {
        let ihl = self.headers.ip.header_len;
        if let TransportHeader::Tcp(tcp) = &mut self.headers.transport {
            tcp.seq = seq;
            write_u32(self.buffer.spare_mut(), ihl + 4, seq);
        }
    }

    pub fn set_tcp_ack(&mut self, ack: u32) {
        let ihl = self.headers.ip.header_len;
        if let TransportHeader::Tcp(tcp) = &mut self.headers.transport {
            tcp.ack = ack;
            write_u32(self.buffer.spare_mut(), ihl + 8, ack);
        }
    }

    pub fn set_tcp_flags(&mut self, flags: TcpFlags) {
        let ihl = self.headers.ip.header_len;
        if let TransportHeader::Tcp(tcp) = &mut self.headers.transport {
            tcp.flags = flags;
            self.buffer.spare_mut()[ihl + 13] = flags.0;
        }
    }

    /// Recompute the IPv4 and transport checksums and release the buffer for delivery.
    pub fn finish(mut self) -> PooledBuffer {
        let total_len = self.headers.ip.total_len;
        self.buffer.set_len(total_len);
        let bytes = &mut self.buffer.spare_mut()[..total_len];
        recalculate_ipv4_checksum(bytes);
        match self.headers.ip.protocol {
            TransportProtocol::Tcp => recalculate_tcp_checksum(bytes),
            TransportProtocol::Udp => recalculate_udp_checksum(bytes),
        }
        self.buffer
    }

    /// Give the buffer back without touching its contents.
    pub fn into_buffer(self) -> PooledBuffer {
        self.buffer
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("headers", &self.headers)
            .field("payload_len", &self.headers.payload_len())
            .finish()
    }
}

/// Fields of a TCP segment synthesized towards the device.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// Maximum segment size option, only sent on SYN-ACK.
    pub mss: Option<u16>,
}

impl TcpSegment {
    pub fn header_len(&self) -> usize {
        TCP_HEADER_LEN + if self.mss.is_some() { TCP_OPT_MSS_LEN } else { 0 }
    }

    /// Offset at which the payload must sit before calling [`write_tcp_segment`].
    pub fn payload_offset(&self) -> usize {
        IPV4_HEADER_LEN + self.header_len()
    }
}

/// Write IPv4 + TCP headers around a payload already placed at
/// `segment.payload_offset()`, then fill both checksums. Returns the packet length.
pub fn write_tcp_segment(buf: &mut [u8], segment: &TcpSegment, payload_len: usize) -> usize {
    let tcp_len = segment.header_len();
    let total_len = IPV4_HEADER_LEN + tcp_len + payload_len;

    write_ipv4_header(buf, *segment.src.ip(), *segment.dst.ip(), TransportProtocol::Tcp, total_len);

    let t = IPV4_HEADER_LEN;
    write_u16(buf, t, segment.src.port());
    write_u16(buf, t + 2, segment.dst.port());
    write_u32(buf, t + 4, segment.seq);
    write_u32(buf, t + 8, segment.ack);
    buf[t + 12] = ((tcp_len / 4) as u8) << 4;
    buf[t + 13] = segment.flags.0;
    write_u16(buf, t + 14, segment.window);
    write_u16(buf, t + 16, 0);
    write_u16(buf, t + 18, 0);
    if let Some(mss) = segment.mss {
        buf[t + 20] = TCP_OPT_MSS;
        buf[t + 21] = TCP_OPT_MSS_LEN as u8;
        write_u16(buf, t + 22, mss);
    }

    let packet = &mut buf[..total_len];
    recalculate_ipv4_checksum(packet);
    recalculate_tcp_checksum(packet);
    total_len
}

/// Copy `payload` into place and build a complete TCP packet.
pub fn build_tcp_segment(buf: &mut [u8], segment: &TcpSegment, payload: &[u8]) -> usize {
    let offset = segment.payload_offset();
    buf[offset..offset + payload.len()].copy_from_slice(payload);
    write_tcp_segment(buf, segment, payload.len())
}

/// Write IPv4 + UDP headers around a payload already placed at
/// [`UDP_PAYLOAD_OFFSET`], then fill both checksums. Returns the packet length.
pub fn write_udp_datagram(
    buf: &mut [u8],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload_len: usize,
) -> usize {
    let total_len = UDP_PAYLOAD_OFFSET + payload_len;
    write_ipv4_header(buf, *src.ip(), *dst.ip(), TransportProtocol::Udp, total_len);

    let u = IPV4_HEADER_LEN;
    write_u16(buf, u, src.port());
    write_u16(buf, u + 2, dst.port());
    write_u16(buf, u + 4, (UDP_HEADER_LEN + payload_len) as u16);
    write_u16(buf, u + 6, 0);

    let packet = &mut buf[..total_len];
    recalculate_ipv4_checksum(packet);
    recalculate_udp_checksum(packet);
    total_len
}

/// Copy `payload` into place and build a complete UDP packet.
pub fn build_udp_datagram(
    buf: &mut [u8],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> usize {
    buf[UDP_PAYLOAD_OFFSET..UDP_PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
    write_udp_datagram(buf, src, dst, payload.len())
}

fn write_ipv4_header(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: TransportProtocol,
    total_len: usize,
) {
    buf[0] = 0x45;
    buf[1] = 0;
    write_u16(buf, 2, total_len as u16);
    write_u16(buf, 4, 0);
    write_u16(buf, 6, FLAG_DONT_FRAGMENT);
    buf[8] = DEFAULT_TTL;
    buf[9] = protocol.number();
    write_u16(buf, 10, 0);
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
}

// --- Checksums (RFC 1071) ---

/// Recalculate the IPv4 header checksum.
pub fn recalculate_ipv4_checksum(packet: &mut [u8]) {
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    packet[10] = 0;
    packet[11] = 0;

    let checksum = fold(sum_words(0, &packet[..ihl]));
    write_u16(packet, 10, checksum);
}

/// Recalculate the TCP checksum over the pseudo-header and the whole segment.
pub fn recalculate_tcp_checksum(packet: &mut [u8]) {
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    let total_len = read_u16(packet, 2) as usize;

    packet[ihl + 16] = 0;
    packet[ihl + 17] = 0;

    let checksum = transport_checksum(packet, ihl, total_len);
    write_u16(packet, ihl + 16, checksum);
}

/// Recalculate the UDP checksum.
pub fn recalculate_udp_checksum(packet: &mut [u8]) {
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    let total_len = read_u16(packet, 2) as usize;
    let udp_len = read_u16(packet, ihl + 4) as usize;

    packet[ihl + 6] = 0;
    packet[ihl + 7] = 0;

    let checksum = transport_checksum(packet, ihl, (ihl + udp_len).min(total_len));
    // 0x0000 means "no checksum" for UDP
    let checksum = if checksum == 0 { 0xFFFF } else { checksum };
    write_u16(packet, ihl + 6, checksum);
}

/// Check the IPv4 header and transport checksums of a complete packet.
pub fn verify_checksums(packet: &[u8]) -> bool {
    let Ok(headers) = parse(packet) else {
        return false;
    };
    let ihl = headers.ip.header_len;
    if fold(sum_words(0, &packet[..ihl])) != 0 {
        return false;
    }

    let end = match headers.transport {
        TransportHeader::Tcp(_) => headers.ip.total_len,
        TransportHeader::Udp(udp) => {
            if read_u16(packet, ihl + 6) == 0 {
                return true;
            }
            ihl + udp.length
        }
    };
    transport_checksum(packet, ihl, end) == 0
}

fn transport_checksum(packet: &[u8], ihl: usize, end: usize) -> u16 {
    let segment_len = end - ihl;
    let mut sum = sum_words(0, &packet[12..20]);
    sum += packet[9] as u64;
    sum += segment_len as u64;
    sum = sum_words(sum, &packet[ihl..end]);
    fold(sum)
}

fn sum_words(mut sum: u64, data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    // odd trailing byte is padded with zero
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

// --- Sequence number arithmetic (RFC 1982 style, mod 2^32) ---

/// True when `a` precedes `b` in sequence space.
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// True when `a` follows `b` in sequence space.
pub fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}
