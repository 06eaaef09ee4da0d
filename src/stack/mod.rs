//! Packet-to-flow stack
//!
//! One reader task pulls raw packets from the [`Device`], one writer task
//! pushes packets back, and a sweeper expires idle flows and fake address
//! leases. Each flow gets a bridging task from the [`Dispatcher`]; TCP flows
//! also get an egress task that segments outbound bytes.

mod flow;
mod packet;
mod reassembly;
mod stats;
mod stream;
mod tcp;
mod udp;

pub use flow::{FlowEvent, FlowInfo, FlowKey, FlowTable, Lookup, Protocol};
pub use packet::{
    build_tcp, build_udp, checksum, parse, Packet, TcpFlags, TcpHeader, TcpSegment, Transport,
    PROTO_TCP, PROTO_UDP,
};
pub use reassembly::{Accept, Reassembly};
pub use stats::{StackStats, StackStatsSnapshot};
pub use stream::{FlowStream, StreamChannels, StreamMessage};
pub use tcp::TcpState;
pub use udp::FlowDatagram;

use crate::config::{Backpressure, StackConfig};
use crate::device::Device;
use crate::dispatch::Dispatcher;
use crate::dns::{Resolver, DNS_PORT};
use crate::error::PacketError;
use crate::helper::{Clock, MAX_PACKET_SIZE};
use crate::route::RouteContext;
use crate::rules::Verdict;
use bytes::Bytes;
use flow::FlowCore;
use packet::header_overhead;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tcp::TcpFlow;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use udp::UdpFlow;

/// Packets queued toward the device writer
const WRITER_QUEUE: usize = 1024;

/// Flow events buffered per subscriber
const EVENT_QUEUE: usize = 256;

/// How long `close` waits for tasks to finish
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by the stack's tasks
pub(crate) struct StackInner {
    config: StackConfig,
    device: Arc<dyn Device>,
    route: RouteContext,
    resolver: Arc<Resolver>,
    dispatcher: Arc<Dispatcher>,
    writer: mpsc::Sender<Bytes>,
    stats: Arc<StackStats>,
    events: broadcast::Sender<FlowEvent>,
    clock: Clock,
    tcp: FlowTable<Arc<TcpFlow>>,
    udp: FlowTable<Arc<UdpFlow>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl StackInner {
    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub(crate) async fn send_packet(&self, packet: Vec<u8>) {
        if self.writer.send(Bytes::from(packet)).await.is_err() {
            trace!("Writer stopped, dropping packet");
        }
    }

    fn local_mss(&self, ip: &IpAddr) -> usize {
        self.device
            .mtu()
            .saturating_sub(header_overhead(ip, PROTO_TCP))
            .max(1)
    }

    fn opened(&self, core: &FlowCore) {
        debug!(
            "Flow {} opened: {} via {}",
            core.key, core.route.target, core.route.verdict
        );
        let _ = self.events.send(core.opened_event());
    }

    fn finish(&self, core: &FlowCore, cancel: bool) {
        if !core.finish() {
            return;
        }
        if cancel {
            core.cancel.cancel();
        }
        self.stats.record_closed();
        debug!("Flow {} closed", core.key);
        let _ = self.events.send(core.closed_event());
    }

    fn teardown_tcp(&self, flow: &Arc<TcpFlow>, cancel: bool) {
        self.tcp.remove_if(&flow.core.key, |f| Arc::ptr_eq(f, flow));
        self.finish(&flow.core, cancel);
    }

    fn teardown_udp(&self, flow: &Arc<UdpFlow>) {
        self.udp.remove_if(&flow.core.key, |f| Arc::ptr_eq(f, flow));
        flow.close_inbound();
        self.finish(&flow.core, true);
    }

    /// Reset a TCP flow toward the local side and drop it
    pub(crate) async fn abort_tcp(&self, flow: &Arc<TcpFlow>) {
        if let Some(rst) = flow.reset() {
            self.send_packet(rst).await;
        }
        self.teardown_tcp(flow, true);
    }

    async fn input(self: &Arc<Self>, buf: &[u8]) {
        StackStats::bump(&self.stats.packets_in);
        let packet = match parse(buf, self.config.verify_checksums) {
            Ok(packet) => packet,
            Err(
                e @ (PacketError::UnsupportedVersion(_)
                | PacketError::UnsupportedProtocol(_)
                | PacketError::Fragmented),
            ) => {
                StackStats::bump(&self.stats.unsupported);
                trace!("Dropping packet: {}", e);
                return;
            }
            Err(e) => {
                StackStats::bump(&self.stats.malformed);
                trace!("Dropping packet: {}", e);
                return;
            }
        };

        match packet.transport {
            Transport::Tcp(seg) => self.input_tcp(packet.src, packet.dst, seg).await,
            Transport::Udp(payload) => self.input_udp(packet.src, packet.dst, payload).await,
        }
    }

    async fn input_tcp(self: &Arc<Self>, src: SocketAddr, dst: SocketAddr, seg: TcpSegment<'_>) {
        let key = FlowKey::new(Protocol::Tcp, src, dst);
        if let Some(flow) = self.tcp.get(&key) {
            self.tcp_segment(flow, &seg).await;
            return;
        }

        let opening = seg.flags.contains(TcpFlags::SYN)
            && !seg.flags.contains(TcpFlags::ACK)
            && !seg.flags.contains(TcpFlags::RST);
        if !opening {
            StackStats::bump(&self.stats.orphaned);
            trace!("No flow for {}, dropping segment", key);
            return;
        }

        let route = self.route.route(dst);
        if route.verdict == Verdict::Block {
            StackStats::bump(&self.stats.blocked);
            debug!("Blocked {} ({})", key, route.target);
            return;
        }

        let window = self.config.reassembly_window;
        let mss = self.local_mss(&dst.ip());
        let lookup = self.tcp.get_or_create(key, || {
            if !self.stats.try_open(self.config.max_flows) {
                return None;
            }
            let core = FlowCore::new(key, route, self.cancel.child_token(), self.now_millis());
            let (stream, channels) = FlowStream::new_pair(key, self.config.flow_queue);
            let (flow, syn_ack) =
                TcpFlow::accept(core, &seg, channels.inbound_tx, channels.aborted, window, mss);
            Some((Arc::new(flow), (stream, channels.outbound_rx, syn_ack)))
        });

        match lookup {
            Lookup::Created(flow, (stream, outbound_rx, syn_ack)) => {
                self.opened(&flow.core);
                self.send_packet(syn_ack).await;
                self.tracker
                    .spawn(tcp::run_egress(flow.clone(), outbound_rx, self.clone()));

                let dispatcher = self.dispatcher.clone();
                let route = flow.core.route.clone();
                let cancel = flow.core.cancel.clone();
                self.tracker.spawn(async move {
                    dispatcher.dispatch_stream(stream, route, cancel).await;
                });
            }
            Lookup::Existing(flow) => self.tcp_segment(flow, &seg).await,
            Lookup::Refused => {
                StackStats::bump(&self.stats.table_full);
                warn!("Flow table full, dropping {}", key);
            }
        }
    }

    async fn tcp_segment(self: &Arc<Self>, flow: Arc<TcpFlow>, seg: &TcpSegment<'_>) {
        flow.core.touch(self.now_millis());

        let permit = match (seg.payload.is_empty(), flow.inbound_sender()) {
            (false, Some(tx)) => match self.config.backpressure {
                Backpressure::Block => tokio::select! {
                    _ = flow.core.cancel.cancelled() => return,
                    permit = tx.reserve_owned() => permit.ok(),
                },
                Backpressure::Drop => match tx.try_reserve_owned() {
                    Ok(permit) => Some(permit),
                    Err(TrySendError::Full(_)) => {
                        // Not acknowledged, so the local side retransmits.
                        StackStats::bump(&self.stats.backpressure_drops);
                        trace!("Flow {} queue full, dropping segment", flow.core.key);
                        return;
                    }
                    Err(TrySendError::Closed(_)) => None,
                },
            },
            _ => None,
        };

        let outcome = flow.on_segment(seg, self.local_mss(&flow.core.key.dst.ip()), permit);
        for packet in outcome.packets {
            self.send_packet(packet).await;
        }
        if outcome.overflow {
            StackStats::bump(&self.stats.window_overflows);
            warn!("Flow {} exceeded the reassembly window, reset", flow.core.key);
        }
        if outcome.teardown {
            self.teardown_tcp(&flow, !outcome.graceful);
        }
    }

    async fn input_udp(self: &Arc<Self>, src: SocketAddr, dst: SocketAddr, payload: &[u8]) {
        if dst.port() == DNS_PORT {
            self.spawn_dns(src, dst, Bytes::copy_from_slice(payload));
            return;
        }

        let key = FlowKey::new(Protocol::Udp, src, dst);
        let flow = match self.udp.get(&key) {
            Some(flow) => flow,
            None => {
                let route = self.route.route(dst);
                if route.verdict == Verdict::Block {
                    StackStats::bump(&self.stats.blocked);
                    debug!("Blocked {} ({})", key, route.target);
                    return;
                }
                let lookup = self.udp.get_or_create(key, || {
                    if !self.stats.try_open(self.config.max_flows) {
                        return None;
                    }
                    let core =
                        FlowCore::new(key, route, self.cancel.child_token(), self.now_millis());
                    let (tx, rx) = mpsc::channel(self.config.flow_queue);
                    Some((Arc::new(UdpFlow::new(core, tx)), rx))
                });
                match lookup {
                    Lookup::Created(flow, rx) => {
                        self.opened(&flow.core);
                        let datagram = FlowDatagram::new(
                            flow.clone(),
                            rx,
                            self.writer.clone(),
                            self.clock,
                            self.device.mtu(),
                        );
                        let stack = self.clone();
                        let bridged = flow.clone();
                        self.tracker.spawn(async move {
                            let route = bridged.core.route.clone();
                            let cancel = bridged.core.cancel.clone();
                            stack
                                .dispatcher
                                .dispatch_datagram(datagram, route, cancel)
                                .await;
                            stack.teardown_udp(&bridged);
                        });
                        flow
                    }
                    Lookup::Existing(flow) => flow,
                    Lookup::Refused => {
                        StackStats::bump(&self.stats.table_full);
                        warn!("Flow table full, dropping {}", key);
                        return;
                    }
                }
            }
        };

        flow.core.touch(self.now_millis());
        flow.core.add_uploaded(payload.len());
        let Some(tx) = flow.inbound_sender() else {
            return;
        };
        let data = Bytes::copy_from_slice(payload);
        match self.config.backpressure {
            Backpressure::Block => {
                tokio::select! {
                    _ = flow.core.cancel.cancelled() => {}
                    _ = tx.send(data) => {}
                }
            }
            Backpressure::Drop => {
                if let Err(TrySendError::Full(_)) = tx.try_send(data) {
                    StackStats::bump(&self.stats.backpressure_drops);
                    trace!("Flow {} queue full, dropping datagram", key);
                }
            }
        }
    }

    fn spawn_dns(self: &Arc<Self>, src: SocketAddr, dst: SocketAddr, query: Bytes) {
        StackStats::bump(&self.stats.dns_queries);
        let stack = self.clone();
        self.tracker.spawn(async move {
            let answer = tokio::select! {
                _ = stack.cancel.cancelled() => return,
                answer = stack.resolver.handle(&query) => answer,
            };
            match answer {
                Ok(answer) => stack.send_packet(build_udp(dst, src, &answer)).await,
                Err(e) => debug!("DNS query from {} failed: {}", src, e),
            }
        });
    }

    async fn sweep(&self, now: Instant) -> usize {
        let now_ms = self.clock.millis_at(now);
        let tcp_idle = self.config.tcp_idle().as_millis() as u64;
        let udp_idle = self.config.udp_idle().as_millis() as u64;
        let mut closed = 0;

        for flow in self.tcp.values() {
            if flow.core.idle_for(now_ms) >= tcp_idle {
                debug!("Flow {} idle, resetting", flow.core.key);
                self.abort_tcp(&flow).await;
                closed += 1;
            }
        }
        for flow in self.udp.values() {
            if flow.core.idle_for(now_ms) >= udp_idle {
                debug!("Flow {} idle, closing", flow.core.key);
                self.teardown_udp(&flow);
                closed += 1;
            }
        }

        let expired = self.route.fake_ips().sweep(now);
        if expired > 0 {
            debug!("Reclaimed {} expired fake addresses", expired);
        }
        closed
    }

    /// Tear down every flow, resetting TCP flows straight onto the device
    /// since the writer has already stopped
    async fn close_all(&self) {
        for flow in self.tcp.values() {
            if let Some(rst) = flow.reset() {
                match self.device.send(&rst).await {
                    Ok(()) => StackStats::bump(&self.stats.packets_out),
                    Err(e) => debug!("Reset for {} not delivered: {}", flow.core.key, e),
                }
            }
            self.teardown_tcp(&flow, true);
        }
        for flow in self.udp.values() {
            self.teardown_udp(&flow);
        }
    }
}

async fn read_loop(stack: Arc<StackInner>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let read = tokio::select! {
            _ = stack.cancel.cancelled() => break,
            read = stack.device.recv(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                if !stack.cancel.is_cancelled() {
                    error!("Packet source {} closed, stopping", stack.device.name());
                }
                stack.cancel.cancel();
                break;
            }
            Ok(n) => stack.input(&buf[..n]).await,
            Err(e) => {
                error!("Packet source {} failed: {}", stack.device.name(), e);
                stack.cancel.cancel();
                break;
            }
        }
    }
    debug!("Stack reader stopped");
}

async fn write_loop(
    device: Arc<dyn Device>,
    mut rx: mpsc::Receiver<Bytes>,
    stats: Arc<StackStats>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        if let Err(e) = device.send(&packet).await {
            error!("Packet sink {} failed: {}", device.name(), e);
            cancel.cancel();
            break;
        }
        StackStats::bump(&stats.packets_out);
    }
    debug!("Stack writer stopped");
}

async fn sweep_loop(stack: Arc<StackInner>) {
    let period = stack.config.sweep_every();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stack.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let closed = stack.sweep(Instant::now()).await;
                if closed > 0 {
                    debug!("Swept {} idle flows", closed);
                }
            }
        }
    }
}

/// Running packet-to-flow stack
pub struct Stack {
    inner: Arc<StackInner>,
}

impl Stack {
    /// Start the reader, writer and sweeper tasks on `device`
    ///
    /// Cancelling `cancel` stops the stack; the stack cancels it itself when
    /// the device fails.
    pub fn start(
        device: Arc<dyn Device>,
        config: StackConfig,
        route: RouteContext,
        resolver: Arc<Resolver>,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
    ) -> Self {
        let (writer, writer_rx) = mpsc::channel(WRITER_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let inner = Arc::new(StackInner {
            config,
            device: device.clone(),
            route,
            resolver,
            dispatcher,
            writer,
            stats: Arc::new(StackStats::new()),
            events,
            clock: Clock::new(),
            tcp: FlowTable::new(),
            udp: FlowTable::new(),
            cancel: cancel.clone(),
            tracker: TaskTracker::new(),
        });

        inner.tracker.spawn(write_loop(
            device.clone(),
            writer_rx,
            inner.stats.clone(),
            cancel,
        ));
        inner.tracker.spawn(read_loop(inner.clone()));
        inner.tracker.spawn(sweep_loop(inner.clone()));

        info!("Stack started on {} (mtu {})", device.name(), device.mtu());
        Stack { inner }
    }

    /// Process one raw packet as if it was read from the device
    pub async fn input(&self, packet: &[u8]) {
        self.inner.input(packet).await;
    }

    /// Counters
    pub fn stats(&self) -> StackStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Subscribe to flow open/close events
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.events.subscribe()
    }

    /// Active flows
    pub fn flows(&self) -> Vec<FlowInfo> {
        let tcp = self.inner.tcp.values().into_iter().map(|f| f.core.info());
        let udp = self.inner.udp.values().into_iter().map(|f| f.core.info());
        tcp.chain(udp).collect()
    }

    /// Number of active flows
    pub fn flow_count(&self) -> usize {
        self.inner.tcp.len() + self.inner.udp.len()
    }

    /// State of a TCP flow
    pub fn tcp_state(&self, key: &FlowKey) -> Option<TcpState> {
        self.inner.tcp.get(key).map(|f| f.state())
    }

    /// Expire flows idle at `now` and sweep the fake address pool
    pub async fn sweep(&self, now: Instant) -> usize {
        self.inner.sweep(now).await
    }

    /// Whether the stack is still running
    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Wait until the stack stops
    pub async fn stopped(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Stop every task and tear down all flows
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        if tokio::time::timeout(CLOSE_TIMEOUT, self.inner.close_all())
            .await
            .is_err()
        {
            warn!("Flows did not reset within {:?}", CLOSE_TIMEOUT);
        }
        self.inner.tracker.close();
        if tokio::time::timeout(CLOSE_TIMEOUT, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("Stack tasks did not finish within {:?}", CLOSE_TIMEOUT);
        }
        info!("Stack stopped");
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("device", &self.inner.device.name())
            .field("flows", &self.flow_count())
            .field("running", &self.is_running())
            .finish()
    }
}
