use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use localdns_core::stats::FlowKind;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::buffer::PooledBuffer;
use crate::dns_intercept::{
    is_dns_packet, is_mdns_packet, parse_dns_query, resolve_override, write_dns_response,
};
use crate::error::RelayError;
use crate::flow::{Activity, FlowKey, FlowTable};
use crate::packet::{write_udp_datagram, Packet, UDP_PAYLOAD_OFFSET};
use crate::relay::RelayContext;
use crate::selector::{self, Selected, Selector, SelectorHandle};

/// Datagrams read from one socket before yielding to other flows.
const READ_BATCH: usize = 16;
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Real socket backing one UDP conversation.
pub struct UdpFlow {
    socket: Arc<UdpSocket>,
    last_activity: Instant,
}

impl Activity for UdpFlow {
    fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

/// Per-flow UDP forwarding with local answers for overridden DNS names.
pub struct UdpRelay {
    ctx: RelayContext,
    flows: FlowTable<UdpFlow>,
    selector: SelectorHandle<FlowKey, UdpSocket>,
}

impl UdpRelay {
    pub fn new(ctx: RelayContext) -> (Arc<Self>, Selector<FlowKey, UdpSocket>) {
        let (handle, selector) = selector::channel();
        let relay = Arc::new(Self {
            ctx,
            flows: FlowTable::new(),
            selector: handle,
        });
        (relay, selector)
    }

    /// Device → network half.
    pub async fn run_output(
        self: Arc<Self>,
        mut ingress: mpsc::Receiver<Packet>,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        let mut sweep = tokio::time::interval(self.ctx.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = ingress.recv() => match packet {
                    Some(packet) => self.handle_packet(packet).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep_idle(Instant::now()),
            }
        }
        Ok(())
    }

    async fn handle_packet(&self, packet: Packet) {
        let dst_port = packet.dst_port();

        if self.ctx.config.drop_mdns && is_mdns_packet(dst_port) {
            self.ctx.stats.record_dropped();
            tracing::trace!(src = %packet.source(), "dropping mDNS packet");
            return;
        }

        let packet = if is_dns_packet(dst_port) {
            match self.answer_locally(packet) {
                Ok(Some(reply)) => {
                    self.ctx.stats.record_dns_override();
                    self.ctx.send_to_device(reply).await;
                    return;
                }
                Ok(None) => return,
                Err(packet) => packet,
            }
        } else {
            packet
        };

        self.forward(packet).await;
    }

    /// Turn a DNS query for an overridden name into its response, in place.
    ///
    /// Hands the packet back untouched when it must go to the real resolver.
    fn answer_locally(&self, mut packet: Packet) -> Result<Option<PooledBuffer>, Packet> {
        let Some(query) = parse_dns_query(packet.payload()) else {
            return Err(packet);
        };
        let Some(answer) = resolve_override(&query, &self.ctx.hosts) else {
            return Err(packet);
        };

        let ttl = self.ctx.config.dns_ttl_secs;
        let Some(len) = write_dns_response(packet.payload_capacity_mut(), &query, answer, ttl)
        else {
            return Err(packet);
        };

        packet.swap();
        if let Err(e) = packet.set_payload_len(len) {
            tracing::debug!(error = %e, domain = %query.domain, "dropping oversized DNS answer");
            return Ok(None);
        }

        tracing::debug!(
            domain = %query.domain,
            qtype = query.qtype,
            answer = ?answer,
            "answered DNS query from host table"
        );
        Ok(Some(packet.finish()))
    }

    async fn forward(&self, packet: Packet) {
        let key = FlowKey::from_packet(&packet);

        let socket = match self.flow_socket(&key) {
            Ok(socket) => socket,
            Err(e) => {
                self.ctx.stats.record_socket_error();
                tracing::warn!(error = %RelayError::socket(key, e), "failed to open UDP flow");
                return;
            }
        };

        if let Err(e) = socket.send(packet.payload()).await {
            self.ctx.stats.record_socket_error();
            tracing::debug!(error = %RelayError::socket(key, e), "UDP send failed, closing flow");
            self.close_flow(&key, false);
        }
    }

    /// Socket for `key`, opening a new flow when there is none.
    fn flow_socket(&self, key: &FlowKey) -> io::Result<Arc<UdpSocket>> {
        if let Some(mut flow) = self.flows.get_mut(key) {
            flow.last_activity = Instant::now();
            return Ok(Arc::clone(&flow.socket));
        }

        if self.flows.len() >= self.ctx.config.udp_max_flows {
            if let Some(oldest) = self.flows.oldest() {
                tracing::debug!(flow = %oldest, "UDP flow limit reached, evicting oldest");
                self.close_flow(&oldest, true);
            }
        }

        let socket = Arc::new(self.open_socket(key)?);
        self.flows.insert(
            *key,
            UdpFlow {
                socket: Arc::clone(&socket),
                last_activity: Instant::now(),
            },
        );
        self.selector.register(*key, Arc::clone(&socket));
        self.ctx.stats.record_flow_open(FlowKind::Udp);
        tracing::debug!(flow = %key, "UDP flow opened");
        Ok(socket)
    }

    fn open_socket(&self, key: &FlowKey) -> io::Result<UdpSocket> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        self.ctx.protector.protect(socket.as_raw_fd())?;
        socket.connect(SocketAddr::V4(key.remote))?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)
    }

    fn close_flow(&self, key: &FlowKey, evicted: bool) {
        if self.flows.remove(key).is_some() {
            self.selector.deregister(*key);
            self.ctx.stats.record_flow_close(FlowKind::Udp, evicted);
            tracing::debug!(flow = %key, evicted, "UDP flow closed");
        }
    }

    fn sweep_idle(&self, now: Instant) {
        let idle = self.flows.take_idle(now, self.ctx.config.udp_idle_timeout());
        for (key, _) in &idle {
            self.selector.deregister(*key);
            self.ctx.stats.record_flow_close(FlowKind::Udp, true);
        }
        if !idle.is_empty() {
            tracing::debug!(count = idle.len(), "evicted idle UDP flows");
        }
    }

    /// Network → device half.
    pub async fn run_input(
        self: Arc<Self>,
        mut selector: Selector<FlowKey, UdpSocket>,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        let timeout = self.ctx.config.select_timeout();

        loop {
            let selected = tokio::select! {
                _ = cancel.cancelled() => break,
                selected = selector.select(timeout) => selected,
            };

            let Selected::Ready { key, source, result } = selected else {
                continue;
            };

            let outcome = match result {
                Ok(()) => self.drain_socket(&key, &source).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => selector.rearm(&key),
                Err(e) => {
                    self.ctx.stats.record_socket_error();
                    tracing::debug!(error = %RelayError::socket(key, e), "UDP receive failed, closing flow");
                    selector.deregister(&key);
                    let removed = self
                        .flows
                        .remove_if(&key, |flow| Arc::ptr_eq(&flow.socket, &source));
                    if removed.is_some() {
                        self.ctx.stats.record_flow_close(FlowKind::Udp, false);
                    }
                }
            }
        }

        selector.close();
        Ok(())
    }

    /// Relay pending responses from `socket` back to the flow's client.
    async fn drain_socket(&self, key: &FlowKey, socket: &UdpSocket) -> io::Result<()> {
        for _ in 0..READ_BATCH {
            let mut buffer = self.ctx.pool.acquire();
            let max_payload = (buffer.capacity() - UDP_PAYLOAD_OFFSET).min(MAX_UDP_PAYLOAD);
            let window = &mut buffer.spare_mut()[UDP_PAYLOAD_OFFSET..UDP_PAYLOAD_OFFSET + max_payload];

            let n = match socket.try_recv(window) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };

            let len = write_udp_datagram(buffer.spare_mut(), key.remote, key.client, n);
            buffer.set_len(len);

            if let Some(mut flow) = self.flows.get_mut(key) {
                flow.last_activity = Instant::now();
            }
            if !self.ctx.send_to_device(buffer).await {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Close every real socket. Returns the number of flows closed.
    pub fn close_all(&self) -> usize {
        let flows = self.flows.drain();
        for _ in &flows {
            self.ctx.stats.record_flow_close(FlowKind::Udp, false);
        }
        flows.len()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn has_flow(&self, key: &FlowKey) -> bool {
        self.flows.contains(key)
    }
}
