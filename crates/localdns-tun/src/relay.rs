use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use localdns_core::config::RelayConfig;
use localdns_core::dns::HostTable;
use localdns_core::stats::{RelayStats, StatsSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::device::TunDevice;
use crate::error::RelayError;
use crate::protect::SocketProtector;
use crate::pump::TunPump;
use crate::tcp::TcpRelay;
use crate::udp::UdpRelay;

/// Shared state every relay worker is constructed with.
#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    pub pool: BufferPool,
    pub hosts: Arc<HostTable>,
    pub stats: Arc<RelayStats>,
    pub protector: Arc<dyn SocketProtector>,
    /// Tunnel MTU; device-bound TCP segments carry at most `mtu - 40` bytes.
    pub mtu: u16,
    device_tx: mpsc::Sender<PooledBuffer>,
}

impl RelayContext {
    /// Build the context and the receiving end of the network→device queue.
    pub fn new(
        config: RelayConfig,
        mtu: u16,
        hosts: Arc<HostTable>,
        protector: Arc<dyn SocketProtector>,
    ) -> (Self, mpsc::Receiver<PooledBuffer>) {
        let (device_tx, device_rx) = mpsc::channel(config.queue_capacity);
        let ctx = Self {
            pool: BufferPool::new(config.buffer_size),
            config: Arc::new(config),
            hosts,
            stats: Arc::new(RelayStats::new()),
            protector,
            mtu,
            device_tx,
        };
        (ctx, device_rx)
    }

    /// Maximum TCP payload per device-bound segment.
    pub fn mss(&self) -> u16 {
        self.mtu.saturating_sub(40)
    }

    /// Queue a finished packet for the tunnel. Returns false once the pump is gone.
    pub async fn send_to_device(&self, buffer: PooledBuffer) -> bool {
        self.device_tx.send(buffer).await.is_ok()
    }
}

#[derive(Clone)]
struct Health {
    running: Arc<AtomicBool>,
    halted: CancellationToken,
}

impl Health {
    fn fail(&self) {
        self.running.store(false, Ordering::Release);
        self.halted.cancel();
    }
}

/// Running relay: one tunnel pump plus an output and an input worker per transport.
pub struct RelayHandle {
    ctx: RelayContext,
    udp: Arc<UdpRelay>,
    tcp: Arc<TcpRelay>,
    health: Health,
    ingress_stop: CancellationToken,
    workers_stop: CancellationToken,
    pump: JoinHandle<Option<TunDevice>>,
    workers: Vec<JoinHandle<Option<()>>>,
}

/// Spawn the five relay workers over `device`.
pub fn start(
    device: TunDevice,
    ctx: RelayContext,
    device_rx: mpsc::Receiver<PooledBuffer>,
) -> RelayHandle {
    let capacity = ctx.config.queue_capacity;
    let (udp_tx, udp_rx) = mpsc::channel(capacity);
    let (tcp_tx, tcp_rx) = mpsc::channel(capacity);

    let health = Health {
        running: Arc::new(AtomicBool::new(true)),
        halted: CancellationToken::new(),
    };
    let ingress_stop = CancellationToken::new();
    let workers_stop = CancellationToken::new();

    let (udp, udp_selector) = UdpRelay::new(ctx.clone());
    let (tcp, tcp_selector) = TcpRelay::new(ctx.clone());

    tracing::info!(
        device = %device.name(),
        mtu = ctx.mtu,
        hosts = ctx.hosts.len(),
        "starting relay"
    );

    let pump = TunPump::new(
        device,
        ctx.pool.clone(),
        udp_tx,
        tcp_tx,
        device_rx,
        Arc::clone(&ctx.stats),
    );
    let pump = spawn_worker("tun pump", health.clone(), pump.run(ingress_stop.clone()));

    let workers = vec![
        spawn_worker(
            "udp output",
            health.clone(),
            Arc::clone(&udp).run_output(udp_rx, workers_stop.clone()),
        ),
        spawn_worker(
            "udp input",
            health.clone(),
            Arc::clone(&udp).run_input(udp_selector, workers_stop.clone()),
        ),
        spawn_worker(
            "tcp output",
            health.clone(),
            Arc::clone(&tcp).run_output(tcp_rx, workers_stop.clone()),
        ),
        spawn_worker(
            "tcp input",
            health.clone(),
            Arc::clone(&tcp).run_input(tcp_selector, workers_stop.clone()),
        ),
    ];

    RelayHandle {
        ctx,
        udp,
        tcp,
        health,
        ingress_stop,
        workers_stop,
        pump,
        workers,
    }
}

/// Run a worker, turning errors and panics into a health failure.
fn spawn_worker<T, F>(name: &'static str, health: Health, worker: F) -> JoinHandle<Option<T>>
where
    F: Future<Output = Result<T, RelayError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(async move {
        let error = match AssertUnwindSafe(worker).catch_unwind().await {
            Ok(Ok(value)) => {
                tracing::debug!(worker = name, "worker stopped");
                return Some(value);
            }
            Ok(Err(e)) => e,
            Err(_) => RelayError::WorkerPanicked(name),
        };
        tracing::error!(worker = name, error = %error, "relay worker failed");
        health.fail();
        None
    })
}

impl RelayHandle {
    /// False once any worker has failed or the relay has been shut down.
    pub fn is_running(&self) -> bool {
        self.health.running.load(Ordering::Acquire)
    }

    /// Resolves when a worker fails.
    pub async fn stopped(&self) {
        self.health.halted.cancelled().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn hosts(&self) -> &Arc<HostTable> {
        &self.ctx.hosts
    }

    /// Ordered teardown: stop ingress, stop the workers and their selectors,
    /// close every real socket, close the tunnel, then drain the pool.
    pub async fn shutdown(self) -> StatsSnapshot {
        tracing::info!("stopping relay");

        self.ingress_stop.cancel();
        let device = self.pump.await.ok().flatten();

        self.workers_stop.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "relay worker did not join cleanly");
            }
        }

        let udp_closed = self.udp.close_all();
        let tcp_closed = self.tcp.close_all().await;
        tracing::debug!(udp = udp_closed, tcp = tcp_closed, "real sockets closed");

        drop(device);

        self.ctx.pool.drain();
        self.health.running.store(false, Ordering::Release);

        let stats = self.ctx.stats.snapshot();
        tracing::info!(
            from_device = stats.packets_from_device,
            to_device = stats.packets_to_device,
            dropped = stats.packets_dropped,
            dns_overrides = stats.dns_overrides,
            udp_flows = stats.udp_flows_opened,
            tcp_flows = stats.tcp_flows_opened,
            "relay stopped"
        );
        stats
    }
}
