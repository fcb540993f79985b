use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use localdns_core::stats::FlowKind;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::RelayError;
use crate::flow::{Activity, FlowKey, FlowTable};
use crate::packet::{
    seq_after, seq_before, write_tcp_segment, Packet, TcpFlags, TcpHeader, TcpSegment, TCP_PAYLOAD_OFFSET,
};
use crate::relay::RelayContext;
use crate::selector::{self, ReadinessSource, Selected, Selector, SelectorHandle};

/// Segments read from one socket before yielding to other flows.
const READ_BATCH: usize = 16;
const WINDOW: u16 = 65535;

/// Device-facing connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// SYN-ACK sent, waiting for the device's ACK.
    SynReceived,
    Established,
    /// The device sent FIN; the real side may still be sending.
    CloseWait,
    /// Our FIN is sent; waiting for its ACK (and the device FIN if still open).
    LastAck,
}

enum WriterCommand {
    Data(Bytes),
    Shutdown,
}

/// Per-flow TCP control block.
struct Tcb {
    id: u64,
    state: TcpState,
    /// Next sequence number expected from the device.
    rcv_nxt: u32,
    /// Next sequence number we send to the device.
    snd_nxt: u32,
    /// Oldest sequence number the device has not acknowledged.
    snd_una: u32,
    /// Receive window the device last advertised (unscaled).
    snd_wnd: u32,
    isn: u32,
    device_fin: bool,
    fin_acked: bool,
    writer: mpsc::UnboundedSender<WriterCommand>,
    /// Set once the real socket is connected.
    reader: Option<Arc<RemoteReader>>,
    /// Reading stopped because the device window is full.
    reader_paused: bool,
    cancel: CancellationToken,
    last_activity: Instant,
}

impl Activity for Tcb {
    fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

/// Read half of a flow's real socket, tagged with the flow it belongs to.
pub struct RemoteReader {
    flow_id: u64,
    half: OwnedReadHalf,
}

#[async_trait]
impl ReadinessSource for RemoteReader {
    async fn readable(&self) -> io::Result<()> {
        self.half.readable().await
    }
}

/// Result of applying one device segment to a TCB.
#[derive(Default)]
struct Step {
    reply: Option<TcpSegment>,
    remove: bool,
    /// Reader to watch again after the device window reopened.
    resume: Option<Arc<RemoteReader>>,
}

enum ReadOutcome {
    /// Socket drained; wait for the next readiness.
    Pending,
    /// Device window is full; the next acknowledgement re-registers the reader.
    Paused,
    Eof,
    /// The flow is gone or the tunnel is shutting down.
    Gone,
}

/// TCP splicing proxy: terminates the device's connection and drives an
/// independent real connection to the same destination.
///
/// Nothing sent to the device is retransmitted. Remote data is only read
/// while it fits in the window the device last advertised; the SYN-ACK
/// offers no window scaling, so that window is at most 64 KiB.
pub struct TcpRelay {
    ctx: RelayContext,
    flows: FlowTable<Tcb>,
    selector: SelectorHandle<FlowKey, RemoteReader>,
    writers: TaskTracker,
    next_id: AtomicU64,
}

impl TcpRelay {
    pub fn new(ctx: RelayContext) -> (Arc<Self>, Selector<FlowKey, RemoteReader>) {
        let (handle, selector) = selector::channel();
        let relay = Arc::new(Self {
            ctx,
            flows: FlowTable::new(),
            selector: handle,
            writers: TaskTracker::new(),
            next_id: AtomicU64::new(1),
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
                    Some(packet) => self.handle_segment(packet).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep_idle(Instant::now()),
            }
        }
        Ok(())
    }

    async fn handle_segment(self: &Arc<Self>, packet: Packet) {
        let Some(tcp) = packet.tcp().copied() else {
            return;
        };
        let key = FlowKey::from_packet(&packet);

        if tcp.flags.contains(TcpFlags::RST) {
            self.close_flow(&key, false);
            return;
        }

        let step = match self.flows.get_mut(&key) {
            Some(mut tcb) => on_segment(&mut tcb, &key, &tcp, packet.payload(), self.ctx.mss()),
            None if tcp.flags == TcpFlags::SYN => Step {
                reply: Some(self.open_flow(key, &tcp)),
                ..Step::default()
            },
            None => {
                tracing::trace!(flow = %key, flags = ?tcp.flags, "segment for unknown flow, resetting");
                Step {
                    reply: Some(reset_for(&key, &tcp, packet.payload().len())),
                    ..Step::default()
                }
            }
        };
        drop(packet);

        if let Some(reader) = step.resume {
            tracing::trace!(flow = %key, "device window reopened");
            self.selector.register(key, reader);
        }
        if step.remove {
            if self.flows.remove(&key).is_some() {
                self.selector.deregister(key);
                self.ctx.stats.record_flow_close(FlowKind::Tcp, false);
                tracing::debug!(flow = %key, "TCP flow closed");
            }
        }
        if let Some(segment) = step.reply {
            self.send_segment(&segment, &[]).await;
        }
    }

    /// Create the TCB for a new SYN and start connecting. Returns the SYN-ACK.
    fn open_flow(self: &Arc<Self>, key: FlowKey, syn: &TcpHeader) -> TcpSegment {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let isn: u32 = rand::random();
        let (writer, commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let tcb = Tcb {
            id,
            state: TcpState::SynReceived,
            rcv_nxt: syn.seq.wrapping_add(1),
            snd_nxt: isn.wrapping_add(1),
            snd_una: isn.wrapping_add(1),
            snd_wnd: u32::from(syn.window),
            isn,
            device_fin: false,
            fin_acked: false,
            writer,
            reader: None,
            reader_paused: false,
            cancel: cancel.clone(),
            last_activity: Instant::now(),
        };
        let syn_ack = syn_ack_for(&key, &tcb, self.ctx.mss());
        self.flows.insert(key, tcb);
        self.ctx.stats.record_flow_open(FlowKind::Tcp);
        tracing::debug!(flow = %key, "TCP flow opened");

        self.writers
            .spawn(Arc::clone(self).run_writer(key, id, commands, cancel));
        syn_ack
    }

    /// Owns the real socket's write side: connects, then writes device bytes in order.
    async fn run_writer(
        self: Arc<Self>,
        key: FlowKey,
        id: u64,
        commands: mpsc::UnboundedReceiver<WriterCommand>,
        cancel: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.connect_and_write(key, id, commands) => result,
        };
        if let Err(e) = result {
            self.abort_flow(&key, id, e).await;
        }
    }

    async fn connect_and_write(
        &self,
        key: FlowKey,
        id: u64,
        mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    ) -> io::Result<()> {
        let socket = TcpSocket::new_v4()?;
        self.ctx.protector.protect(socket.as_raw_fd())?;

        let connect = socket.connect(SocketAddr::V4(key.remote));
        let stream = tokio::time::timeout(self.ctx.config.tcp_connect_timeout(), connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;

        let (half, mut write_half) = stream.into_split();
        let reader = Arc::new(RemoteReader { flow_id: id, half });
        match self.flows.get_mut(&key) {
            Some(mut tcb) if tcb.id == id => tcb.reader = Some(Arc::clone(&reader)),
            _ => return Ok(()),
        }
        self.selector.register(key, reader);
        tracing::debug!(flow = %key, "connected to remote");

        while let Some(command) = commands.recv().await {
            match command {
                WriterCommand::Data(bytes) => write_half.write_all(&bytes).await?,
                WriterCommand::Shutdown => write_half.shutdown().await?,
            }
        }
        Ok(())
    }

    /// Network → device half.
    pub async fn run_input(
        self: Arc<Self>,
        mut selector: Selector<FlowKey, RemoteReader>,
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
                Ok(ReadOutcome::Pending) => selector.rearm(&key),
                Ok(ReadOutcome::Paused) => {}
                Ok(ReadOutcome::Eof) => {
                    selector.deregister(&key);
                    self.on_remote_eof(&key, source.flow_id).await;
                }
                Ok(ReadOutcome::Gone) => {
                    selector.deregister(&key);
                }
                Err(e) => {
                    selector.deregister(&key);
                    self.abort_flow(&key, source.flow_id, e).await;
                }
            }
        }

        selector.close();
        Ok(())
    }

    /// Copy available bytes from the real socket to the device, one MSS at a time.
    async fn drain_socket(&self, key: &FlowKey, reader: &RemoteReader) -> io::Result<ReadOutcome> {
        let mss = self.ctx.mss() as usize;

        for _ in 0..READ_BATCH {
            let window = {
                let Some(mut tcb) = self.flows.get_mut(key) else {
                    return Ok(ReadOutcome::Gone);
                };
                if tcb.id != reader.flow_id {
                    return Ok(ReadOutcome::Gone);
                }
                let in_flight = tcb.snd_nxt.wrapping_sub(tcb.snd_una);
                let window = tcb.snd_wnd.saturating_sub(in_flight) as usize;
                if window == 0 {
                    tcb.reader_paused = true;
                    tracing::trace!(flow = %key, in_flight, "device window full, pausing reads");
                    return Ok(ReadOutcome::Paused);
                }
                window
            };

            let mut buffer = self.ctx.pool.acquire();
            let end = (TCP_PAYLOAD_OFFSET + mss.min(window)).min(buffer.capacity());
            let n = match reader.half.try_read(&mut buffer.spare_mut()[TCP_PAYLOAD_OFFSET..end]) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Pending),
                Err(e) => return Err(e),
            };

            let segment = {
                let Some(mut tcb) = self.flows.get_mut(key) else {
                    return Ok(ReadOutcome::Gone);
                };
                if tcb.id != reader.flow_id {
                    return Ok(ReadOutcome::Gone);
                }
                let segment = reply_to(key, &tcb, TcpFlags::ACK | TcpFlags::PSH);
                tcb.snd_nxt = tcb.snd_nxt.wrapping_add(n as u32);
                tcb.last_activity = Instant::now();
                segment
            };

            let len = write_tcp_segment(buffer.spare_mut(), &segment, n);
            buffer.set_len(len);
            if !self.ctx.send_to_device(buffer).await {
                return Ok(ReadOutcome::Gone);
            }
        }
        Ok(ReadOutcome::Pending)
    }

    /// The real peer finished sending: FIN the device and wait in LAST_ACK.
    async fn on_remote_eof(&self, key: &FlowKey, flow_id: u64) {
        let fin = {
            let Some(mut tcb) = self.flows.get_mut(key) else {
                return;
            };
            if tcb.id != flow_id {
                return;
            }
            let fin = reply_to(key, &tcb, TcpFlags::FIN | TcpFlags::ACK);
            tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
            tcb.state = TcpState::LastAck;
            tcb.last_activity = Instant::now();
            fin
        };
        tracing::debug!(flow = %key, "remote closed, sending FIN");
        self.send_segment(&fin, &[]).await;
    }

    /// Tear down one flow after a real-socket failure and reset the device side.
    async fn abort_flow(&self, key: &FlowKey, flow_id: u64, error: io::Error) {
        let Some(tcb) = self.flows.remove_if(key, |tcb| tcb.id == flow_id) else {
            return;
        };
        tcb.cancel.cancel();
        self.selector.deregister(*key);
        self.ctx.stats.record_socket_error();
        self.ctx.stats.record_flow_close(FlowKind::Tcp, false);
        tracing::debug!(error = %RelayError::socket(*key, error), "TCP flow aborted");

        let rst = reply_to(key, &tcb, TcpFlags::RST | TcpFlags::ACK);
        self.send_segment(&rst, &[]).await;
    }

    /// Drop a flow immediately, without telling the device.
    fn close_flow(&self, key: &FlowKey, evicted: bool) {
        if let Some(tcb) = self.flows.remove(key) {
            tcb.cancel.cancel();
            self.selector.deregister(*key);
            self.ctx.stats.record_flow_close(FlowKind::Tcp, evicted);
            tracing::debug!(flow = %key, state = ?tcb.state, evicted, "TCP flow dropped");
        }
    }

    fn sweep_idle(&self, now: Instant) {
        let idle = self.flows.take_idle(now, self.ctx.config.tcp_idle_timeout());
        for (key, tcb) in &idle {
            tcb.cancel.cancel();
            self.selector.deregister(*key);
            self.ctx.stats.record_flow_close(FlowKind::Tcp, true);
            tracing::debug!(flow = %key, state = ?tcb.state, "TCP flow idle, evicted");
        }
    }

    async fn send_segment(&self, segment: &TcpSegment, payload: &[u8]) {
        let mut buffer = self.ctx.pool.acquire();
        let offset = segment.payload_offset();
        buffer.spare_mut()[offset..offset + payload.len()].copy_from_slice(payload);
        let len = write_tcp_segment(buffer.spare_mut(), segment, payload.len());
        buffer.set_len(len);
        self.ctx.send_to_device(buffer).await;
    }

    /// Close every real socket and wait for the per-flow writers to finish.
    pub async fn close_all(&self) -> usize {
        let flows = self.flows.drain();
        let closed = flows.len();
        for (_, tcb) in flows {
            tcb.cancel.cancel();
            self.ctx.stats.record_flow_close(FlowKind::Tcp, false);
        }
        self.writers.close();
        self.writers.wait().await;
        closed
    }

    pub fn state(&self, key: &FlowKey) -> Option<TcpState> {
        self.flows.get(key).map(|tcb| tcb.state)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

/// Apply one device segment to an existing TCB.
fn on_segment(tcb: &mut Tcb, key: &FlowKey, tcp: &TcpHeader, payload: &[u8], mss: u16) -> Step {
    let mut step = Step::default();

    if tcp.flags.contains(TcpFlags::SYN) {
        // retransmitted SYN: our SYN-ACK was lost
        if tcb.state == TcpState::SynReceived && tcp.seq.wrapping_add(1) == tcb.rcv_nxt {
            step.reply = Some(syn_ack_for(key, tcb, mss));
        }
        return step;
    }
    if !tcp.flags.contains(TcpFlags::ACK) {
        return step;
    }
    tcb.last_activity = Instant::now();

    match tcb.state {
        TcpState::SynReceived => {
            if tcp.ack != tcb.isn.wrapping_add(1) {
                return step;
            }
            tcb.state = TcpState::Established;
            tracing::trace!(flow = %key, "TCP handshake complete");
        }
        TcpState::LastAck if tcp.ack == tcb.snd_nxt => tcb.fin_acked = true,
        _ => {}
    }

    // acceptable ACK: not older than snd_una, not beyond what we sent
    if !seq_before(tcp.ack, tcb.snd_una) && !seq_after(tcp.ack, tcb.snd_nxt) {
        tcb.snd_una = tcp.ack;
        tcb.snd_wnd = u32::from(tcp.window);
        let in_flight = tcb.snd_nxt.wrapping_sub(tcb.snd_una);
        if tcb.reader_paused && in_flight < tcb.snd_wnd {
            tcb.reader_paused = false;
            step.resume = tcb.reader.clone();
        }
    }

    let mut ack_needed = false;
    let payload_len = payload.len() as u32;

    if !payload.is_empty() {
        if tcp.seq == tcb.rcv_nxt && !tcb.device_fin {
            // a closed writer means the flow is being aborted
            let _ = tcb
                .writer
                .send(WriterCommand::Data(Bytes::copy_from_slice(payload)));
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(payload_len);
        } else {
            tracing::trace!(
                flow = %key,
                seq = tcp.seq,
                expected = tcb.rcv_nxt,
                duplicate = seq_before(tcp.seq, tcb.rcv_nxt),
                "ignoring out-of-window segment"
            );
        }
        ack_needed = true;
    }

    if tcp.flags.contains(TcpFlags::FIN) {
        let fin_seq = tcp.seq.wrapping_add(payload_len);
        if !tcb.device_fin && fin_seq == tcb.rcv_nxt {
            tcb.device_fin = true;
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
            let _ = tcb.writer.send(WriterCommand::Shutdown);
            if tcb.state == TcpState::Established {
                tcb.state = TcpState::CloseWait;
            }
            tracing::trace!(flow = %key, state = ?tcb.state, "device sent FIN");
        }
        ack_needed = true;
    }

    if tcb.state == TcpState::LastAck && tcb.fin_acked && tcb.device_fin {
        step.remove = true;
    }
    if ack_needed {
        step.reply = Some(reply_to(key, tcb, TcpFlags::ACK));
    }
    step
}

/// Segment from the remote side of `key` carrying the TCB's current counters.
fn reply_to(key: &FlowKey, tcb: &Tcb, flags: TcpFlags) -> TcpSegment {
    TcpSegment {
        src: key.remote,
        dst: key.client,
        seq: tcb.snd_nxt,
        ack: tcb.rcv_nxt,
        flags,
        window: WINDOW,
        mss: None,
    }
}

fn syn_ack_for(key: &FlowKey, tcb: &Tcb, mss: u16) -> TcpSegment {
    TcpSegment {
        src: key.remote,
        dst: key.client,
        seq: tcb.isn,
        ack: tcb.rcv_nxt,
        flags: TcpFlags::SYN | TcpFlags::ACK,
        window: WINDOW,
        mss: Some(mss),
    }
}

/// RST answering a segment that matches no flow (RFC 793 reset generation).
fn reset_for(key: &FlowKey, tcp: &TcpHeader, payload_len: usize) -> TcpSegment {
    let (seq, ack, flags) = if tcp.flags.contains(TcpFlags::ACK) {
        (tcp.ack, 0, TcpFlags::RST)
    } else {
        let mut len = payload_len as u32;
        if tcp.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if tcp.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        (0, tcp.seq.wrapping_add(len), TcpFlags::RST | TcpFlags::ACK)
    };
    TcpSegment {
        src: key.remote,
        dst: key.client,
        seq,
        ack,
        flags,
        window: 0,
        mss: None,
    }
}
