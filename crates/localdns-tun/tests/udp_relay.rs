mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use localdns_core::config::RelayConfig;
use localdns_core::dns::HostTable;
use localdns_core::stats::RelayStats;
use localdns_tun::buffer::{BufferPool, PooledBuffer};
use localdns_tun::dns_intercept::{TYPE_A, TYPE_AAAA};
use localdns_tun::flow::FlowKey;
use localdns_tun::packet::{Packet, TransportProtocol};
use localdns_tun::udp::UdpRelay;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RESOLVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);

struct Harness {
    relay: Arc<UdpRelay>,
    ingress: mpsc::Sender<Packet>,
    device_rx: mpsc::Receiver<PooledBuffer>,
    pool: BufferPool,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
}

fn harness(config: RelayConfig, hosts: HostTable) -> Harness {
    let (ctx, device_rx) = context(config, hosts);
    let pool = ctx.pool.clone();
    let stats = Arc::clone(&ctx.stats);
    let (relay, selector) = UdpRelay::new(ctx);
    let (ingress, ingress_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    tokio::spawn(Arc::clone(&relay).run_output(ingress_rx, cancel.clone()));
    tokio::spawn(Arc::clone(&relay).run_input(selector, cancel.clone()));

    Harness {
        relay,
        ingress,
        device_rx,
        pool,
        stats,
        cancel,
    }
}

impl Harness {
    async fn send(&self, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) {
        let packet = udp_packet(&self.pool, src, dst, payload);
        self.ingress.send(packet).await.unwrap();
    }
}

fn blocked_hosts() -> HostTable {
    HostTable::from_entries([
        ("blocked.example", Ipv4Addr::UNSPECIFIED),
        ("intranet.example", Ipv4Addr::new(192, 168, 1, 10)),
    ])
}

/// UDP socket that sends every datagram straight back.
async fn echo_server() -> SocketAddrV4 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let std::net::SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
        unreachable!();
    };
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_overridden_name_is_answered_locally() {
    let mut h = harness(RelayConfig::default(), blocked_hosts());
    let device = client(40100);

    h.send(device, RESOLVER, &dns_query(0xBEEF, "blocked.example", TYPE_A)).await;
    let buffer = next_to_device(&mut h.device_rx).await;
    let (headers, payload) = decode_udp(&buffer);

    assert_eq!(headers.ip.src, *RESOLVER.ip());
    assert_eq!(headers.ip.dst, *device.ip());
    assert_eq!(headers.src_port(), 53);
    assert_eq!(headers.dst_port(), device.port());

    assert_eq!(&payload[0..2], &[0xBE, 0xEF]);
    // QR set, one answer
    assert_eq!(payload[2] & 0x80, 0x80);
    assert_eq!(&payload[6..8], &[0, 1]);
    assert_eq!(&payload[payload.len() - 4..], &[0, 0, 0, 0]);

    assert_eq!(h.relay.flow_count(), 0);
    assert_eq!(h.stats.snapshot().dns_overrides, 1);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_override_returns_configured_address() {
    let mut h = harness(RelayConfig::default(), blocked_hosts());

    h.send(client(40101), RESOLVER, &dns_query(7, "intranet.example.", TYPE_A)).await;
    let (_, payload) = decode_udp(&next_to_device(&mut h.device_rx).await);

    assert_eq!(&payload[payload.len() - 4..], &[192, 168, 1, 10]);
    assert_eq!(h.relay.flow_count(), 0);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_aaaa_for_overridden_name_has_no_answers() {
    let mut h = harness(RelayConfig::default(), blocked_hosts());

    h.send(client(40102), RESOLVER, &dns_query(9, "blocked.example", TYPE_AAAA)).await;
    let (_, payload) = decode_udp(&next_to_device(&mut h.device_rx).await);

    assert_eq!(&payload[0..2], &[0, 9]);
    assert_eq!(&payload[6..8], &[0, 0]);
    assert_eq!(h.relay.flow_count(), 0);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_datagrams_are_forwarded_and_answered() {
    let remote = echo_server().await;
    let mut h = harness(RelayConfig::default(), HostTable::new());
    let device = client(40103);

    h.send(device, remote, b"ping").await;
    let (headers, payload) = decode_udp(&next_to_device(&mut h.device_rx).await);

    assert_eq!(payload, b"ping");
    assert_eq!(headers.ip.src, *remote.ip());
    assert_eq!(headers.src_port(), remote.port());
    assert_eq!(headers.ip.dst, *device.ip());
    assert_eq!(headers.dst_port(), device.port());

    // second datagram reuses the flow
    h.send(device, remote, b"pong").await;
    let (_, payload) = decode_udp(&next_to_device(&mut h.device_rx).await);
    assert_eq!(payload, b"pong");

    assert_eq!(h.relay.flow_count(), 1);
    assert!(h.relay.has_flow(&FlowKey::new(TransportProtocol::Udp, device, remote)));
    assert_eq!(h.stats.snapshot().udp_flows_opened, 1);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_mdns_is_dropped() {
    let mut h = harness(RelayConfig::default(), HostTable::new());
    let mdns = SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 251), 5353);

    h.send(client(5353), mdns, &dns_query(0, "printer.local", TYPE_A)).await;

    assert!(eventually(Duration::from_secs(2), || h.stats.snapshot().packets_dropped == 1).await);
    assert!(tokio::time::timeout(Duration::from_millis(200), h.device_rx.recv())
        .await
        .is_err());
    assert_eq!(h.relay.flow_count(), 0);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_flow_limit_evicts_oldest() {
    let config = RelayConfig {
        udp_max_flows: 2,
        ..RelayConfig::default()
    };
    let mut h = harness(config, HostTable::new());
    let remotes = [echo_server().await, echo_server().await, echo_server().await];

    for (i, remote) in remotes.iter().enumerate() {
        h.send(client(40110 + i as u16), *remote, b"x").await;
        next_to_device(&mut h.device_rx).await;
    }

    assert_eq!(h.relay.flow_count(), 2);
    let stats = h.stats.snapshot();
    assert_eq!(stats.udp_flows_opened, 3);
    assert_eq!(stats.flows_evicted, 1);

    h.cancel.cancel();
}

#[tokio::test]
async fn test_idle_flows_are_swept() {
    let remote = echo_server().await;
    let config = RelayConfig {
        udp_idle_timeout_secs: 1,
        sweep_interval_secs: 1,
        ..RelayConfig::default()
    };
    let mut h = harness(config, HostTable::new());

    h.send(client(40120), remote, b"hello").await;
    next_to_device(&mut h.device_rx).await;
    assert_eq!(h.relay.flow_count(), 1);

    assert!(eventually(Duration::from_secs(5), || h.relay.flow_count() == 0).await);
    assert_eq!(h.stats.snapshot().flows_evicted, 1);

    h.cancel.cancel();
}
