use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Relay-wide traffic counters.
///
/// Updated from every worker with relaxed atomics; readers only need an
/// approximate view.
pub struct RelayStats {
    /// Packets read from the tunnel and handed to a relay.
    packets_from_device: AtomicU64,
    /// Packets written back to the tunnel.
    packets_to_device: AtomicU64,
    /// Packets dropped before reaching a relay (malformed, unsupported, queue full).
    packets_dropped: AtomicU64,
    /// DNS queries answered from the host table.
    dns_overrides: AtomicU64,
    udp_flows_opened: AtomicU64,
    tcp_flows_opened: AtomicU64,
    active_udp_flows: AtomicU64,
    active_tcp_flows: AtomicU64,
    /// Flows removed by the idle sweep or capacity eviction.
    flows_evicted: AtomicU64,
    /// Per-flow socket failures.
    socket_errors: AtomicU64,
}

/// Snapshot of relay statistics for logging.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_from_device: u64,
    pub packets_to_device: u64,
    pub packets_dropped: u64,
    pub dns_overrides: u64,
    pub udp_flows_opened: u64,
    pub tcp_flows_opened: u64,
    pub active_udp_flows: u64,
    pub active_tcp_flows: u64,
    pub flows_evicted: u64,
    pub socket_errors: u64,
}

/// Transport a flow counter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Udp,
    Tcp,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            packets_from_device: AtomicU64::new(0),
            packets_to_device: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            dns_overrides: AtomicU64::new(0),
            udp_flows_opened: AtomicU64::new(0),
            tcp_flows_opened: AtomicU64::new(0),
            active_udp_flows: AtomicU64::new(0),
            active_tcp_flows: AtomicU64::new(0),
            flows_evicted: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
        }
    }

    pub fn record_from_device(&self) {
        self.packets_from_device.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_to_device(&self) {
        self.packets_to_device.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_override(&self) {
        self.dns_overrides.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new flow being opened.
    pub fn record_flow_open(&self, kind: FlowKind) {
        let (opened, active) = self.flow_counters(kind);
        opened.fetch_add(1, Ordering::Relaxed);
        active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flow being closed; `evicted` marks idle or capacity eviction.
    pub fn record_flow_close(&self, kind: FlowKind, evicted: bool) {
        let (_, active) = self.flow_counters(kind);
        active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();
        if evicted {
            self.flows_evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flow_counters(&self, kind: FlowKind) -> (&AtomicU64, &AtomicU64) {
        match kind {
            FlowKind::Udp => (&self.udp_flows_opened, &self.active_udp_flows),
            FlowKind::Tcp => (&self.tcp_flows_opened, &self.active_tcp_flows),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_from_device: self.packets_from_device.load(Ordering::Relaxed),
            packets_to_device: self.packets_to_device.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            dns_overrides: self.dns_overrides.load(Ordering::Relaxed),
            udp_flows_opened: self.udp_flows_opened.load(Ordering::Relaxed),
            tcp_flows_opened: self.tcp_flows_opened.load(Ordering::Relaxed),
            active_udp_flows: self.active_udp_flows.load(Ordering::Relaxed),
            active_tcp_flows: self.active_tcp_flows.load(Ordering::Relaxed),
            flows_evicted: self.flows_evicted.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_open_close() {
        let stats = RelayStats::new();
        stats.record_flow_open(FlowKind::Tcp);
        stats.record_flow_open(FlowKind::Udp);
        stats.record_flow_close(FlowKind::Tcp, true);
        // closing more than opened must not underflow
        stats.record_flow_close(FlowKind::Tcp, false);

        let snap = stats.snapshot();
        assert_eq!(snap.tcp_flows_opened, 1);
        assert_eq!(snap.active_tcp_flows, 0);
        assert_eq!(snap.active_udp_flows, 1);
        assert_eq!(snap.flows_evicted, 1);
    }
}
