use std::io;
use std::sync::Arc;

use localdns_core::stats::RelayStats;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::device::TunDevice;
use crate::error::RelayError;
use crate::packet::Packet;

/// Sole owner of the tunnel descriptor.
///
/// Reads datagrams into pooled buffers and routes them to the UDP or TCP
/// ingress queue; writes every buffer arriving on the network→device queue
/// back to the tunnel.
pub struct TunPump {
    device: TunDevice,
    pool: BufferPool,
    udp_tx: mpsc::Sender<Packet>,
    tcp_tx: mpsc::Sender<Packet>,
    device_rx: mpsc::Receiver<PooledBuffer>,
    stats: Arc<RelayStats>,
}

enum Event {
    Stop,
    Read(io::Result<usize>),
    Outbound(Option<PooledBuffer>),
}

impl TunPump {
    pub fn new(
        device: TunDevice,
        pool: BufferPool,
        udp_tx: mpsc::Sender<Packet>,
        tcp_tx: mpsc::Sender<Packet>,
        device_rx: mpsc::Receiver<PooledBuffer>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            device,
            pool,
            udp_tx,
            tcp_tx,
            device_rx,
            stats,
        }
    }

    /// Pump until `cancel` fires. Hands the device back on a clean stop.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<TunDevice, RelayError> {
        tracing::info!(device = %self.device.name(), "tun pump started");

        // buffer of a dropped packet, reused for the next read
        let mut spare: Option<PooledBuffer> = None;
        let mut outbound_open = true;

        loop {
            let mut buffer = spare.take().unwrap_or_else(|| self.pool.acquire());

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Stop,
                out = self.device_rx.recv(), if outbound_open => Event::Outbound(out),
                read = self.device.recv(buffer.spare_mut()) => Event::Read(read),
            };

            match event {
                Event::Stop => break,
                Event::Outbound(Some(out)) => {
                    spare = Some(buffer);
                    self.write_fully(&out).await?;
                }
                Event::Outbound(None) => {
                    outbound_open = false;
                    spare = Some(buffer);
                }
                Event::Read(Ok(0)) => {
                    return Err(RelayError::TunnelIo(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "tunnel descriptor closed",
                    )));
                }
                Event::Read(Ok(n)) => {
                    buffer.set_len(n);
                    self.stats.record_from_device();
                    spare = self.route(buffer);
                }
                Event::Read(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {
                    spare = Some(buffer);
                }
                Event::Read(Err(e)) => return Err(RelayError::TunnelIo(e)),
            }
        }

        tracing::info!(device = %self.device.name(), "tun pump stopped");
        Ok(self.device)
    }

    /// Hand a packet to its relay. Returns the buffer when the packet was dropped.
    fn route(&self, buffer: PooledBuffer) -> Option<PooledBuffer> {
        let packet = match Packet::from_buffer(buffer) {
            Ok(packet) => packet,
            Err((e, buffer)) => {
                self.stats.record_dropped();
                if e.is_malformed() {
                    tracing::debug!(error = %e, len = buffer.len(), "dropping malformed packet");
                } else {
                    tracing::trace!(error = %e, "dropping unsupported packet");
                }
                return Some(buffer);
            }
        };

        let queue = if packet.is_tcp() { &self.tcp_tx } else { &self.udp_tx };
        match queue.try_send(packet) {
            Ok(()) => None,
            Err(TrySendError::Full(packet)) => {
                self.stats.record_dropped();
                tracing::trace!(protocol = %packet.protocol(), "ingress queue full, dropping packet");
                Some(packet.into_buffer())
            }
            Err(TrySendError::Closed(packet)) => {
                self.stats.record_dropped();
                Some(packet.into_buffer())
            }
        }
    }

    async fn write_fully(&self, packet: &[u8]) -> Result<(), RelayError> {
        let mut written = 0;
        while written < packet.len() {
            match self.device.send(&packet[written..]).await {
                Ok(0) => {
                    return Err(RelayError::TunnelIo(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "tunnel accepted no bytes",
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RelayError::TunnelIo(e)),
            }
        }
        self.stats.record_to_device();
        Ok(())
    }
}
