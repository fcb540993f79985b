#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use localdns_core::config::RelayConfig;
use localdns_core::dns::HostTable;
use localdns_tun::buffer::{BufferPool, PooledBuffer};
use localdns_tun::packet::{
    self, build_tcp_segment, build_udp_datagram, Packet, PacketHeaders, TcpFlags, TcpHeader,
    TcpSegment, TransportHeader,
};
use localdns_tun::protect::NoProtect;
use localdns_tun::RelayContext;
use tokio::sync::mpsc;

pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 111, 0, 2);

pub fn client(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(CLIENT_IP, port)
}

pub fn context(
    config: RelayConfig,
    hosts: HostTable,
) -> (RelayContext, mpsc::Receiver<PooledBuffer>) {
    RelayContext::new(config, 1500, Arc::new(hosts), Arc::new(NoProtect))
}

pub fn udp_packet(pool: &BufferPool, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Packet {
    let mut buffer = pool.acquire();
    let len = build_udp_datagram(buffer.spare_mut(), src, dst, payload);
    buffer.set_len(len);
    Packet::from_buffer(buffer).map_err(|(e, _)| e).unwrap()
}

pub fn tcp_packet(
    pool: &BufferPool,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Packet {
    let segment = TcpSegment {
        src,
        dst,
        seq,
        ack,
        flags,
        window: 65535,
        mss: None,
    };
    tcp_segment_packet(pool, &segment, payload)
}

pub fn tcp_segment_packet(pool: &BufferPool, segment: &TcpSegment, payload: &[u8]) -> Packet {
    let mut buffer = pool.acquire();
    let len = build_tcp_segment(buffer.spare_mut(), segment, payload);
    buffer.set_len(len);
    Packet::from_buffer(buffer).map_err(|(e, _)| e).unwrap()
}

/// Next packet the relay queued for the device.
pub async fn next_to_device(rx: &mut mpsc::Receiver<PooledBuffer>) -> PooledBuffer {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a device-bound packet")
        .expect("device queue closed")
}

/// Parse a device-bound TCP packet, checking its checksums.
pub fn decode_tcp(buffer: &[u8]) -> (PacketHeaders, TcpHeader, Vec<u8>) {
    assert!(packet::verify_checksums(buffer), "bad checksums on device-bound packet");
    let headers = packet::parse(buffer).unwrap();
    let TransportHeader::Tcp(tcp) = headers.transport else {
        panic!("expected a TCP packet");
    };
    let offset = headers.payload_offset();
    let payload = buffer[offset..offset + headers.payload_len()].to_vec();
    (headers, tcp, payload)
}

/// Parse a device-bound UDP packet, checking its checksums.
pub fn decode_udp(buffer: &[u8]) -> (PacketHeaders, Vec<u8>) {
    assert!(packet::verify_checksums(buffer), "bad checksums on device-bound packet");
    let headers = packet::parse(buffer).unwrap();
    assert!(matches!(headers.transport, TransportHeader::Udp(_)));
    let offset = headers.payload_offset();
    let payload = buffer[offset..offset + headers.payload_len()].to_vec();
    (headers, payload)
}

pub fn dns_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut query = Vec::new();
    query.extend_from_slice(&id.to_be_bytes());
    query.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in domain.trim_end_matches('.').split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());
    query
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
