use std::net::Ipv4Addr;

use localdns_core::dns::HostTable;

pub const DNS_PORT: u16 = 53;
pub const MDNS_PORT: u16 = 5353;

/// DNS record types.
pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const FLAG_QR: u16 = 0x8000;
const OPCODE_MASK: u16 = 0x7800;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
/// Compressed name pointer to the question name at offset 12.
const NAME_POINTER: [u8; 2] = [0xC0, 0x0C];
const A_RECORD_LEN: usize = 2 + 2 + 2 + 4 + 2 + 4;

/// Parsed DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    /// Question name with a trailing dot, e.g. `example.com.`
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Offset just past the question section.
    pub question_end: usize,
}

/// Parse a minimal DNS query from raw UDP payload.
///
/// Only standard queries with exactly one question are accepted; names using
/// compression pointers are rejected.
pub fn parse_dns_query(data: &[u8]) -> Option<DnsQuery> {
    if data.len() < HEADER_LEN {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qdcount = u16::from_be_bytes([data[4], data[5]]);

    if flags & FLAG_QR != 0 || flags & OPCODE_MASK != 0 || qdcount != 1 {
        return None;
    }

    let mut offset = HEADER_LEN;
    let mut domain = String::new();

    loop {
        let label_len = *data.get(offset)? as usize;
        offset += 1;
        if label_len == 0 {
            break;
        }
        if label_len > MAX_LABEL_LEN || offset + label_len > data.len() {
            return None;
        }
        domain.push_str(std::str::from_utf8(&data[offset..offset + label_len]).ok()?);
        domain.push('.');
        offset += label_len;
    }

    if domain.is_empty() {
        domain.push('.');
    }

    if offset + 4 > data.len() {
        return None;
    }

    let qtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let qclass = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);

    Some(DnsQuery {
        id,
        flags,
        domain,
        qtype,
        qclass,
        question_end: offset + 4,
    })
}

/// Locally synthesized answer to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsAnswer {
    /// One A record.
    Address(Ipv4Addr),
    /// NOERROR with an empty answer section.
    NoData,
}

/// Decide whether the host table answers this query.
///
/// A queries for a listed name get the mapped address. AAAA queries for a
/// listed name get an empty answer so clients fall back to the IPv4 override.
/// Anything else is resolved by the real network.
pub fn resolve_override(query: &DnsQuery, hosts: &HostTable) -> Option<DnsAnswer> {
    if query.qclass != CLASS_IN {
        return None;
    }
    match query.qtype {
        TYPE_A => hosts.lookup(&query.domain).map(DnsAnswer::Address),
        TYPE_AAAA if hosts.contains(&query.domain) => Some(DnsAnswer::NoData),
        _ => None,
    }
}

/// Bytes needed to turn the query into a response carrying `answer`.
pub fn response_len(query: &DnsQuery, answer: DnsAnswer) -> usize {
    query.question_end
        + match answer {
            DnsAnswer::Address(_) => A_RECORD_LEN,
            DnsAnswer::NoData => 0,
        }
}

/// Rewrite a query message held in `buf` into its response.
///
/// The header and question already in `buf` are reused; the answer record is
/// appended after the question. Returns the response length, or `None` if
/// `buf` is too small (in which case nothing is written).
pub fn write_dns_response(
    buf: &mut [u8],
    query: &DnsQuery,
    answer: DnsAnswer,
    ttl: u32,
) -> Option<usize> {
    let len = response_len(query, answer);
    if buf.len() < len {
        return None;
    }

    let ancount: u16 = match answer {
        DnsAnswer::Address(_) => 1,
        DnsAnswer::NoData => 0,
    };
    let flags = FLAG_QR | (query.flags & FLAG_RD) | FLAG_RA;

    buf[0..2].copy_from_slice(&query.id.to_be_bytes());
    buf[2..4].copy_from_slice(&flags.to_be_bytes());
    buf[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf[6..8].copy_from_slice(&ancount.to_be_bytes());
    buf[8..10].copy_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    buf[10..12].copy_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    if let DnsAnswer::Address(addr) = answer {
        let rr = &mut buf[query.question_end..len];
        rr[0..2].copy_from_slice(&NAME_POINTER);
        rr[2..4].copy_from_slice(&TYPE_A.to_be_bytes());
        rr[4..6].copy_from_slice(&CLASS_IN.to_be_bytes());
        rr[6..10].copy_from_slice(&ttl.to_be_bytes());
        rr[10..12].copy_from_slice(&4u16.to_be_bytes()); // RDLENGTH
        rr[12..16].copy_from_slice(&addr.octets());
    }

    Some(len)
}

/// Check if a UDP packet is destined for DNS (port 53).
pub fn is_dns_packet(dst_port: u16) -> bool {
    dst_port == DNS_PORT
}

pub fn is_mdns_packet(dst_port: u16) -> bool {
    dst_port == MDNS_PORT
}

#[cfg(test)]
pub(crate) fn encode_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut query = Vec::new();
    query.extend_from_slice(&id.to_be_bytes());
    query.extend_from_slice(&[0x01, 0x00]); // standard query, RD=1
    query.extend_from_slice(&[0x00, 0x01]); // QDCOUNT=1
    query.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in domain.trim_end_matches('.').split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());
    query
}
