//! Test utilities and mocks for Tunrats
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tunrats::config::{Backpressure, Config};
use tunrats::handler::{DatagramDyn, Handler, StreamDyn};
use tunrats::stack::{build_tcp, build_udp, parse, TcpFlags, TcpHeader, Transport};
use tunrats::{TargetAddr, TunratsError, Verdict};

/// How long tests wait for a packet before giving up
pub const WAIT: Duration = Duration::from_secs(5);

/// Test configuration builder
pub struct TestConfigBuilder {
    config: Config,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        let mut config = Config::default();
        // Nothing listens here; tests that need an upstream set their own.
        config.name_server = vec!["udp://127.0.0.1:9".to_string()];
        TestConfigBuilder { config }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Domains routed through the tunnel
    pub fn proxy_domains(mut self, domains: &[&str]) -> Self {
        self.config.domain_rules.proxy = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Domains sent directly
    pub fn direct_domains(mut self, domains: &[&str]) -> Self {
        self.config.domain_rules.direct = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Domains dropped
    pub fn blocked_domains(mut self, domains: &[&str]) -> Self {
        self.config.domain_rules.blocked = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    /// CIDRs routed through the tunnel
    pub fn proxy_cidrs(mut self, cidrs: &[&str]) -> Self {
        self.config.ip_cidr_rules.proxy = cidrs.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Verdict for unmatched addresses
    pub fn final_ip(mut self, verdict: Verdict) -> Self {
        self.config.geo_ip.final_verdict = verdict;
        self
    }

    /// IPv4 fake address pool
    pub fn fake_pool(mut self, cidr: &str) -> Self {
        self.config.fake_ip.ipv4_pool = cidr.to_string();
        self
    }

    /// Upstream DNS server
    pub fn name_server(mut self, server: &str) -> Self {
        self.config.name_server = vec![server.to_string()];
        self
    }

    /// Turn DNS hijacking off
    pub fn disable_hijack(mut self) -> Self {
        self.config.domain_rules.disable_hijack = true;
        self
    }

    /// Back-pressure policy
    pub fn backpressure(mut self, policy: Backpressure) -> Self {
        self.config.stack.backpressure = policy;
        self
    }

    /// Per-flow out-of-order buffer
    pub fn reassembly_window(mut self, bytes: usize) -> Self {
        self.config.stack.reassembly_window = bytes;
        self
    }

    /// Per-flow message queue
    pub fn flow_queue(mut self, messages: usize) -> Self {
        self.config.stack.flow_queue = messages;
        self
    }

    /// Interface addresses
    pub fn tun_addr(mut self, addrs: &[&str]) -> Self {
        self.config.tun.addr = addrs.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Stream opened through a [`MockHandler`]; the test holds the far end
pub struct OpenedStream {
    /// Requested destination
    pub target: TargetAddr,
    /// Far end of the stream
    pub remote: DuplexStream,
}

/// Datagram channel opened through a [`MockHandler`]
pub struct OpenedDatagram {
    /// Requested destination
    pub target: TargetAddr,
    /// Datagrams the flow sent
    pub sent: mpsc::UnboundedReceiver<Bytes>,
    /// Inject replies toward the flow
    pub reply: mpsc::UnboundedSender<Bytes>,
}

/// Receiving side of a [`MockHandler`]
pub struct MockProbe {
    streams: mpsc::UnboundedReceiver<OpenedStream>,
    datagrams: mpsc::UnboundedReceiver<OpenedDatagram>,
}

impl MockProbe {
    /// Next stream the handler opened
    pub async fn next_stream(&mut self) -> Option<OpenedStream> {
        tokio::time::timeout(WAIT, self.streams.recv()).await.ok().flatten()
    }

    /// Next datagram channel the handler opened
    pub async fn next_datagram(&mut self) -> Option<OpenedDatagram> {
        tokio::time::timeout(WAIT, self.datagrams.recv())
            .await
            .ok()
            .flatten()
    }

    /// Stream already opened, without waiting
    pub fn try_stream(&mut self) -> Option<OpenedStream> {
        self.streams.try_recv().ok()
    }
}

/// Tunnel handler that hands every opened channel to the test
#[derive(Debug)]
pub struct MockHandler {
    name: String,
    fail: bool,
    stall: bool,
    opened: Mutex<Vec<TargetAddr>>,
    streams: mpsc::UnboundedSender<OpenedStream>,
    datagrams: mpsc::UnboundedSender<OpenedDatagram>,
    closed: AtomicBool,
}

impl MockHandler {
    /// Create a handler and its probe
    pub fn new(name: &str) -> (Arc<Self>, MockProbe) {
        Self::build(name, false, false)
    }

    /// Create a handler whose opens always fail
    pub fn failing(name: &str) -> (Arc<Self>, MockProbe) {
        Self::build(name, true, false)
    }

    /// Create a handler whose opens never complete, so nothing drains the
    /// flow queues
    pub fn stalled(name: &str) -> (Arc<Self>, MockProbe) {
        Self::build(name, false, true)
    }

    fn build(name: &str, fail: bool, stall: bool) -> (Arc<Self>, MockProbe) {
        let (streams_tx, streams) = mpsc::unbounded_channel();
        let (datagrams_tx, datagrams) = mpsc::unbounded_channel();
        let handler = MockHandler {
            name: name.to_string(),
            fail,
            stall,
            opened: Mutex::new(Vec::new()),
            streams: streams_tx,
            datagrams: datagrams_tx,
            closed: AtomicBool::new(false),
        };
        (Arc::new(handler), MockProbe { streams, datagrams })
    }

    /// Every target requested so far
    pub fn opened(&self) -> Vec<TargetAddr> {
        self.opened.lock().clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for MockHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_stream(&self, target: &TargetAddr) -> tunrats::error::Result<Box<dyn StreamDyn>> {
        self.opened.lock().push(target.clone());
        if self.fail {
            return Err(TunratsError::Handler(format!("refusing {}", target)));
        }
        if self.stall {
            std::future::pending::<()>().await;
        }
        let (local, remote) = duplex(64 * 1024);
        let _ = self.streams.send(OpenedStream {
            target: target.clone(),
            remote,
        });
        Ok(Box::new(local))
    }

    async fn open_datagram(
        &self,
        target: &TargetAddr,
    ) -> tunrats::error::Result<Box<dyn DatagramDyn>> {
        self.opened.lock().push(target.clone());
        if self.fail {
            return Err(TunratsError::Handler(format!("refusing {}", target)));
        }
        if self.stall {
            std::future::pending::<()>().await;
        }
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let (reply, replies) = mpsc::unbounded_channel();
        let _ = self.datagrams.send(OpenedDatagram {
            target: target.clone(),
            sent,
            reply,
        });
        Ok(Box::new(MockDatagram {
            sent: sent_tx,
            replies: tokio::sync::Mutex::new(replies),
        }))
    }

    async fn close(&self) -> tunrats::error::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct MockDatagram {
    sent: mpsc::UnboundedSender<Bytes>,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

#[async_trait]
impl DatagramDyn for MockDatagram {
    async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        self.sent
            .send(Bytes::copy_from_slice(payload))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "probe dropped"))
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.replies.lock().await.recv().await {
            Some(reply) => {
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "probe dropped",
            )),
        }
    }
}

/// Segment as seen by the local application
#[derive(Debug, Clone)]
pub struct Seen {
    /// Sequence number
    pub seq: u32,
    /// Acknowledgement number
    pub ack: u32,
    /// Flags
    pub flags: TcpFlags,
    /// Payload
    pub payload: Vec<u8>,
}

/// Local application side of a TCP connection, driven packet by packet
#[derive(Debug, Clone)]
pub struct TcpClient {
    /// Local endpoint
    pub src: SocketAddr,
    /// Destination endpoint
    pub dst: SocketAddr,
    isn: u32,
    /// Next sequence number to send
    pub seq: u32,
    /// Next sequence number expected from the stack
    pub ack: u32,
}

impl TcpClient {
    /// Create a client with initial sequence number `isn`
    pub fn new(src: &str, dst: SocketAddr, isn: u32) -> Self {
        TcpClient {
            src: src.parse().unwrap(),
            dst,
            isn,
            seq: isn,
            ack: 0,
        }
    }

    fn packet(&self, seq: u32, flags: TcpFlags, mss: Option<u16>, payload: &[u8]) -> Vec<u8> {
        build_tcp(
            &TcpHeader {
                src: self.src,
                dst: self.dst,
                seq,
                ack: self.ack,
                flags,
                window: 65535,
                mss,
            },
            payload,
        )
    }

    /// Opening SYN
    pub fn syn(&mut self) -> Vec<u8> {
        self.seq = self.isn.wrapping_add(1);
        self.packet(self.isn, TcpFlags::SYN, Some(1460), &[])
    }

    /// Record the SYN-ACK and return the final handshake ACK
    pub fn handshake(&mut self, syn_ack: &[u8]) -> Vec<u8> {
        let seen = parse_segment(syn_ack);
        assert!(seen.flags.contains(TcpFlags::SYN | TcpFlags::ACK));
        assert_eq!(seen.ack, self.isn.wrapping_add(1));
        self.ack = seen.seq.wrapping_add(1);
        self.packet(self.seq, TcpFlags::ACK, None, &[])
    }

    /// Next in-order data segment
    pub fn data(&mut self, payload: &[u8]) -> Vec<u8> {
        let packet = self.packet(self.seq, TcpFlags::ACK | TcpFlags::PSH, None, payload);
        self.seq = self.seq.wrapping_add(payload.len() as u32);
        packet
    }

    /// Data segment at `offset` bytes past the first data byte; does not advance
    pub fn data_at(&self, offset: u32, payload: &[u8]) -> Vec<u8> {
        let seq = self.isn.wrapping_add(1).wrapping_add(offset);
        self.packet(seq, TcpFlags::ACK | TcpFlags::PSH, None, payload)
    }

    /// Move the send pointer to `offset` bytes past the first data byte
    pub fn advance_to(&mut self, offset: u32) {
        self.seq = self.isn.wrapping_add(1).wrapping_add(offset);
    }

    /// FIN
    pub fn fin(&mut self) -> Vec<u8> {
        let packet = self.packet(self.seq, TcpFlags::FIN | TcpFlags::ACK, None, &[]);
        self.seq = self.seq.wrapping_add(1);
        packet
    }

    /// Pure ACK of everything received so far
    pub fn ack(&self) -> Vec<u8> {
        self.packet(self.seq, TcpFlags::ACK, None, &[])
    }

    /// Record a segment from the stack, advancing the ACK pointer
    pub fn absorb(&mut self, packet: &[u8]) -> Seen {
        let seen = parse_segment(packet);
        if seen.seq == self.ack {
            self.ack = self.ack.wrapping_add(seen.payload.len() as u32);
            if seen.flags.contains(TcpFlags::FIN) {
                self.ack = self.ack.wrapping_add(1);
            }
        }
        seen
    }
}

/// Parse a TCP packet written by the stack
pub fn parse_segment(packet: &[u8]) -> Seen {
    let parsed = parse(packet, true).unwrap();
    match parsed.transport {
        Transport::Tcp(seg) => Seen {
            seq: seg.seq,
            ack: seg.ack,
            flags: seg.flags,
            payload: seg.payload.to_vec(),
        },
        other => panic!("expected tcp, got {:?}", other),
    }
}

/// Parse a UDP packet written by the stack into (src, dst, payload)
pub fn parse_datagram(packet: &[u8]) -> (SocketAddr, SocketAddr, Vec<u8>) {
    let parsed = parse(packet, true).unwrap();
    match parsed.transport {
        Transport::Udp(payload) => (parsed.src, parsed.dst, payload.to_vec()),
        other => panic!("expected udp, got {:?}", other),
    }
}

/// UDP packet from the local side
pub fn udp_packet(src: &str, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    build_udp(src.parse().unwrap(), dst, payload)
}

/// DNS query message
pub fn dns_query(id: u16, name: &str, rtype: RecordType) -> Vec<u8> {
    let mut req = Message::new();
    req.set_id(id);
    req.set_message_type(MessageType::Query);
    req.set_op_code(OpCode::Query);
    req.set_recursion_desired(true);
    req.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    req.to_vec().unwrap()
}

/// First A/AAAA address in a DNS answer
pub fn dns_answer_ip(answer: &[u8]) -> Option<IpAddr> {
    let msg = Message::from_vec(answer).unwrap();
    msg.answers().iter().find_map(|r| match r.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        Some(RData::AAAA(a)) => Some(IpAddr::V6(a.0)),
        _ => None,
    })
}

/// Response code of a DNS answer
pub fn dns_response_code(answer: &[u8]) -> hickory_proto::op::ResponseCode {
    Message::from_vec(answer).unwrap().response_code()
}

/// Upstream DNS transport that records queries and echoes them back
#[derive(Debug, Default)]
pub struct EchoUpstream {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl EchoUpstream {
    /// Queries received so far
    pub fn seen(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl tunrats::dns::Upstream for EchoUpstream {
    async fn query(&self, message: &[u8]) -> tunrats::error::Result<Vec<u8>> {
        self.seen.lock().push(message.to_vec());
        Ok(message.to_vec())
    }
}

/// Read packets from the device until one matches `done`; every TCP
/// segment is absorbed into `client`. Returns the segments seen.
pub async fn recv_until(
    peer: &mut tunrats::device::ChannelPeer,
    client: &mut TcpClient,
    mut done: impl FnMut(&Seen) -> bool,
) -> Vec<Seen> {
    let mut seen = Vec::new();
    loop {
        let packet = peer
            .recv_timeout(WAIT)
            .await
            .expect("timed out waiting for a packet");
        let segment = client.absorb(&packet);
        let finished = done(&segment);
        seen.push(segment);
        if finished {
            return seen;
        }
    }
}

/// Poll `done` until it holds or the wait runs out
pub async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}
