//! UDP flows
//!
//! A UDP flow has no state machine: every datagram from the local side is
//! queued as one message and the flow lives until its idle timer runs out.

use super::flow::{FlowCore, FlowKey};
use super::packet::{build_udp, header_overhead, PROTO_UDP};
use crate::helper::Clock;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// One captured UDP conversation
#[derive(Debug)]
pub(crate) struct UdpFlow {
    pub core: FlowCore,
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl UdpFlow {
    pub fn new(core: FlowCore, inbound: mpsc::Sender<Bytes>) -> Self {
        UdpFlow {
            core,
            inbound: Mutex::new(Some(inbound)),
        }
    }

    pub fn inbound_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.inbound.lock().clone()
    }

    /// Drop the inbound sender so the datagram end sees the close
    pub fn close_inbound(&self) {
        self.inbound.lock().take();
    }
}

/// A UDP flow seen as a message channel
///
/// `recv` yields datagrams sent by the local application; `send` writes a
/// reply datagram back to it, sourced from the address it originally
/// targeted.
#[derive(Debug)]
pub struct FlowDatagram {
    key: FlowKey,
    inbound: mpsc::Receiver<Bytes>,
    writer: mpsc::Sender<Bytes>,
    flow: Arc<UdpFlow>,
    clock: Clock,
    max_payload: usize,
}

impl FlowDatagram {
    pub(crate) fn new(
        flow: Arc<UdpFlow>,
        inbound: mpsc::Receiver<Bytes>,
        writer: mpsc::Sender<Bytes>,
        clock: Clock,
        mtu: usize,
    ) -> Self {
        let key = flow.core.key;
        FlowDatagram {
            key,
            inbound,
            writer,
            flow,
            clock,
            max_payload: mtu.saturating_sub(header_overhead(&key.dst.ip(), PROTO_UDP)),
        }
    }

    /// Flow tuple
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Next datagram from the local application; `None` once the flow is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Send a reply datagram to the local application
    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        if self.flow.core.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "flow closed"));
        }
        if payload.len() > self.max_payload {
            debug!(
                "Dropping {} byte reply on {}: exceeds mtu",
                payload.len(),
                self.key
            );
            return Ok(());
        }
        let packet = build_udp(self.key.dst, self.key.src, payload);
        self.writer
            .send(Bytes::from(packet))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stack stopped"))?;
        self.flow.core.add_downloaded(payload.len());
        self.flow.core.touch(self.clock.now_millis());
        Ok(())
    }
}
