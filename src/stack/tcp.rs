//! TCP flow state machine
//!
//! The stack plays the server side of every captured connection. Segments
//! from the local application are reassembled into the flow's byte channel;
//! bytes written to the [`FlowStream`](super::FlowStream) are cut into
//! segments sized by the peer MSS and limited by the peer's window. There is
//! no retransmission and no congestion control.

use super::flow::FlowCore;
use super::packet::{build_tcp, TcpFlags, TcpHeader, TcpSegment};
use super::reassembly::{Accept, Reassembly};
use super::stream::StreamMessage;
use super::StackInner;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// MSS assumed when the SYN carries none
const DEFAULT_PEER_MSS: usize = 536;

/// TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection
    Closed,
    /// SYN received, SYN-ACK sent
    SynSeen,
    /// Handshake complete
    Established,
    /// At least one side has sent FIN
    FinWait,
    /// Reset by either side
    Reset,
}

/// What the caller must do after a segment was processed
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Packets to write to the device, in order
    pub packets: Vec<Vec<u8>>,
    /// The flow is finished and must leave the table
    pub teardown: bool,
    /// Both FINs were exchanged and acknowledged
    pub graceful: bool,
    /// The reassembly window was exceeded
    pub overflow: bool,
}

enum Next {
    Send(Vec<u8>, usize),
    Wait,
    Stop,
}

#[derive(Debug)]
struct TcpControl {
    state: TcpState,
    /// Peer's initial sequence number
    irs: u32,
    snd_una: u32,
    snd_nxt: u32,
    peer_window: u32,
    peer_mss: usize,
    reassembly: Reassembly,
    /// Stream offset of the peer's FIN once seen
    fin_offset: Option<u64>,
    fin_received: bool,
    fin_sent: bool,
    inbound: Option<mpsc::Sender<Bytes>>,
}

impl TcpControl {
    fn rcv_data_nxt(&self) -> u32 {
        self.irs
            .wrapping_add(1)
            .wrapping_add(self.reassembly.next() as u32)
    }

    fn rcv_nxt(&self) -> u32 {
        let nxt = self.rcv_data_nxt();
        if self.fin_received {
            nxt.wrapping_add(1)
        } else {
            nxt
        }
    }
}

/// One captured TCP connection
#[derive(Debug)]
pub(crate) struct TcpFlow {
    pub core: FlowCore,
    control: Mutex<TcpControl>,
    /// Wakes the egress task when the window opens or the handshake ends
    notify: Notify,
    aborted: Arc<AtomicBool>,
    /// Receive window we advertise
    window: u16,
}

/// Pick an initial sequence number that is hard to predict per tuple
pub(crate) fn initial_sequence(core: &FlowCore) -> u32 {
    let mut hasher = RandomState::new().build_hasher();
    core.key.hash(&mut hasher);
    if let Ok(now) = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        now.as_nanos().hash(&mut hasher);
    }
    hasher.finish() as u32
}

impl TcpFlow {
    /// Accept a SYN; returns the flow and the SYN-ACK to send
    pub fn accept(
        core: FlowCore,
        syn: &TcpSegment<'_>,
        inbound: mpsc::Sender<Bytes>,
        aborted: Arc<AtomicBool>,
        window: usize,
        local_mss: usize,
    ) -> (Self, Vec<u8>) {
        let isn = initial_sequence(&core);
        let peer_mss = syn
            .mss
            .map(|m| m as usize)
            .unwrap_or(DEFAULT_PEER_MSS)
            .min(local_mss)
            .max(1);
        let control = TcpControl {
            state: TcpState::SynSeen,
            irs: syn.seq,
            snd_una: isn,
            snd_nxt: isn.wrapping_add(1),
            peer_window: syn.window as u32,
            peer_mss,
            reassembly: Reassembly::new(window),
            fin_offset: None,
            fin_received: false,
            fin_sent: false,
            inbound: Some(inbound),
        };
        let flow = TcpFlow {
            core,
            control: Mutex::new(control),
            notify: Notify::new(),
            aborted,
            window: window.min(u16::MAX as usize) as u16,
        };
        let syn_ack = flow.syn_ack(&flow.control.lock(), local_mss);
        (flow, syn_ack)
    }

    /// Current state
    pub fn state(&self) -> TcpState {
        self.control.lock().state
    }

    /// Sender for reassembled bytes, if the local side is still open
    pub fn inbound_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.control.lock().inbound.clone()
    }

    fn build(&self, ctl: &TcpControl, seq: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        let header = TcpHeader {
            src: self.core.key.dst,
            dst: self.core.key.src,
            seq,
            ack: ctl.rcv_nxt(),
            flags,
            window: self.window,
            mss: None,
        };
        build_tcp(&header, payload)
    }

    fn syn_ack(&self, ctl: &TcpControl, local_mss: usize) -> Vec<u8> {
        let header = TcpHeader {
            src: self.core.key.dst,
            dst: self.core.key.src,
            seq: ctl.snd_una,
            ack: ctl.irs.wrapping_add(1),
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: self.window,
            mss: Some(local_mss.min(u16::MAX as usize) as u16),
        };
        build_tcp(&header, &[])
    }

    fn ack(&self, ctl: &TcpControl) -> Vec<u8> {
        self.build(ctl, ctl.snd_nxt, TcpFlags::ACK, &[])
    }

    /// Process a segment of an existing flow
    ///
    /// `permit` is a reserved slot in the inbound byte channel; it is used
    /// when the segment makes new in-order bytes available.
    pub fn on_segment(
        &self,
        seg: &TcpSegment<'_>,
        local_mss: usize,
        permit: Option<OwnedPermit<Bytes>>,
    ) -> Outcome {
        let mut out = Outcome::default();
        let mut ctl = self.control.lock();

        if seg.flags.contains(TcpFlags::RST) {
            if !matches!(ctl.state, TcpState::Closed | TcpState::Reset) {
                ctl.state = TcpState::Reset;
                ctl.inbound = None;
                out.teardown = true;
            }
            return out;
        }

        match ctl.state {
            TcpState::SynSeen => {
                if seg.flags.contains(TcpFlags::SYN) {
                    if !seg.flags.contains(TcpFlags::ACK) && seg.seq == ctl.irs {
                        out.packets.push(self.syn_ack(&ctl, local_mss));
                    }
                    return out;
                }
                if !seg.flags.contains(TcpFlags::ACK) || seg.ack != ctl.snd_nxt {
                    return out;
                }
                ctl.state = TcpState::Established;
                trace!("Flow {} established", self.core.key);
            }
            TcpState::Established | TcpState::FinWait => {
                if seg.flags.contains(TcpFlags::SYN) {
                    out.packets.push(self.ack(&ctl));
                    return out;
                }
            }
            TcpState::Closed | TcpState::Reset => return out,
        }

        if seg.flags.contains(TcpFlags::ACK) {
            let acked = seg.ack.wrapping_sub(ctl.snd_una);
            let in_flight = ctl.snd_nxt.wrapping_sub(ctl.snd_una);
            if acked <= in_flight {
                ctl.snd_una = seg.ack;
            }
            ctl.peer_window = seg.window as u32;
            self.notify.notify_one();
        }

        let start = ctl.reassembly.next() as i64 + seg.seq.wrapping_sub(ctl.rcv_data_nxt()) as i32 as i64;
        let mut need_ack = false;

        if !seg.payload.is_empty() {
            need_ack = true;
            let skip = (-start).max(0) as usize;
            if !ctl.fin_received && skip < seg.payload.len() {
                let offset = start.max(0) as u64;
                let data = Bytes::copy_from_slice(&seg.payload[skip..]);
                match ctl.reassembly.push(offset, data) {
                    Accept::Deliver(bytes) => {
                        self.core.add_uploaded(bytes.len());
                        if let Some(permit) = permit {
                            permit.send(bytes);
                        }
                    }
                    Accept::Overflow => {
                        ctl.state = TcpState::Reset;
                        ctl.inbound = None;
                        out.packets
                            .push(self.build(&ctl, ctl.snd_nxt, TcpFlags::RST | TcpFlags::ACK, &[]));
                        out.teardown = true;
                        out.overflow = true;
                        return out;
                    }
                    Accept::Buffered | Accept::Duplicate => {}
                }
            }
        }

        if seg.flags.contains(TcpFlags::FIN) {
            need_ack = true;
            let fin_at = start + seg.payload.len() as i64;
            if !ctl.fin_received && fin_at >= 0 {
                ctl.fin_offset = Some(fin_at as u64);
            }
        }
        if !ctl.fin_received && ctl.fin_offset == Some(ctl.reassembly.next()) {
            ctl.fin_received = true;
            // Dropping the sender is the end-of-stream signal.
            ctl.inbound = None;
            if ctl.state == TcpState::Established {
                ctl.state = TcpState::FinWait;
            }
            debug!("Flow {} closed by local side", self.core.key);
        }

        if need_ack {
            out.packets.push(self.ack(&ctl));
        }
        if ctl.fin_received && ctl.fin_sent && ctl.snd_una == ctl.snd_nxt {
            ctl.state = TcpState::Closed;
            out.teardown = true;
            out.graceful = true;
        }
        out
    }

    fn next_segment(&self, data: &[u8]) -> Next {
        let mut ctl = self.control.lock();
        match ctl.state {
            TcpState::SynSeen => return Next::Wait,
            TcpState::Established | TcpState::FinWait if !ctl.fin_sent => {}
            _ => return Next::Stop,
        }
        let in_flight = ctl.snd_nxt.wrapping_sub(ctl.snd_una);
        let usable = ctl.peer_window.saturating_sub(in_flight) as usize;
        let n = data.len().min(ctl.peer_mss).min(usable);
        if n == 0 {
            return Next::Wait;
        }
        let packet = self.build(&ctl, ctl.snd_nxt, TcpFlags::ACK | TcpFlags::PSH, &data[..n]);
        ctl.snd_nxt = ctl.snd_nxt.wrapping_add(n as u32);
        Next::Send(packet, n)
    }

    fn fin_segment(&self) -> Next {
        let mut ctl = self.control.lock();
        match ctl.state {
            TcpState::SynSeen => return Next::Wait,
            TcpState::Established | TcpState::FinWait if !ctl.fin_sent => {}
            _ => return Next::Stop,
        }
        let packet = self.build(&ctl, ctl.snd_nxt, TcpFlags::FIN | TcpFlags::ACK, &[]);
        ctl.snd_nxt = ctl.snd_nxt.wrapping_add(1);
        ctl.fin_sent = true;
        ctl.state = TcpState::FinWait;
        Next::Send(packet, 0)
    }

    /// Move to `Reset`; returns the RST to send if the flow was still live
    pub fn reset(&self) -> Option<Vec<u8>> {
        let mut ctl = self.control.lock();
        if matches!(ctl.state, TcpState::Closed | TcpState::Reset) {
            return None;
        }
        ctl.state = TcpState::Reset;
        ctl.inbound = None;
        Some(self.build(&ctl, ctl.snd_nxt, TcpFlags::RST | TcpFlags::ACK, &[]))
    }

    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Send `data` toward the local side; false once the flow can no
    /// longer carry data
    async fn transmit(&self, mut data: Bytes, stack: &StackInner, cancel: &CancellationToken) -> bool {
        while !data.is_empty() {
            match self.next_segment(&data) {
                Next::Send(packet, n) => {
                    stack.send_packet(packet).await;
                    self.core.add_downloaded(n);
                    self.core.touch(stack.now_millis());
                    data = data.slice(n..);
                }
                Next::Wait => {
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = self.notify.notified() => {}
                    }
                }
                Next::Stop => return false,
            }
        }
        true
    }

    async fn send_fin(&self, stack: &StackInner, cancel: &CancellationToken) {
        loop {
            match self.fin_segment() {
                Next::Send(packet, _) => {
                    stack.send_packet(packet).await;
                    return;
                }
                Next::Wait => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.notify.notified() => {}
                    }
                }
                Next::Stop => return,
            }
        }
    }
}

/// Drain the stream's outbound messages into segments for the device
pub(crate) async fn run_egress(
    flow: Arc<TcpFlow>,
    mut rx: mpsc::Receiver<StreamMessage>,
    stack: Arc<StackInner>,
) {
    let cancel = flow.core.cancel.clone();
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = rx.recv() => msg,
        };
        if flow.aborted() {
            stack.abort_tcp(&flow).await;
            return;
        }
        match msg {
            Some(StreamMessage::Data(data)) => {
                if !flow.transmit(data, &stack, &cancel).await {
                    return;
                }
            }
            Some(StreamMessage::Close) | None => {
                flow.send_fin(&stack, &cancel).await;
                return;
            }
        }
    }
}
