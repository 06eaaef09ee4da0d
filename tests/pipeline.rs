//! End-to-end pipeline tests over an in-memory device

mod common;

use async_trait::async_trait;
use common::*;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tunrats::config::{Config, DomainRulesConfig};
use tunrats::device::{ChannelDevice, ChannelPeer, Device};
use tunrats::error::Result;
use tunrats::handler::Handler;
use tunrats::stack::Protocol;
use tunrats::{Pipeline, SetupStage, TargetAddr, TunratsError, Verdict};

const DNS_SERVER: &str = "192.168.200.2:53";
const CLIENT_DNS_PORT: &str = "192.168.200.1:53000";

async fn start(config: Config) -> (Pipeline, Arc<ChannelDevice>, ChannelPeer, Arc<MockHandler>, MockProbe) {
    let (device, peer) = ChannelDevice::pair("tun-test", 1500);
    let device = Arc::new(device);
    let (proxy, probe) = MockHandler::new("proxy");
    let pipeline = Pipeline::start(config, device.clone(), proxy.clone())
        .await
        .expect("pipeline failed to start");
    (pipeline, device, peer, proxy, probe)
}

/// Send a DNS query through the device and return the raw answer
async fn lookup(peer: &mut ChannelPeer, id: u16, name: &str, rtype: RecordType) -> Vec<u8> {
    let server: SocketAddr = DNS_SERVER.parse().unwrap();
    peer.send(udp_packet(CLIENT_DNS_PORT, server, &dns_query(id, name, rtype)))
        .await
        .unwrap();
    let reply = peer.recv_timeout(WAIT).await.expect("no DNS answer");
    let (src, dst, payload) = parse_datagram(&reply);
    assert_eq!(src, server);
    assert_eq!(dst, CLIENT_DNS_PORT.parse::<SocketAddr>().unwrap());
    payload
}

#[tokio::test]
async fn test_fake_ip_flow_reaches_proxy_by_name() {
    let config = TestConfigBuilder::new()
        .proxy_domains(&["example.com"])
        .final_ip(Verdict::Bypass)
        .build();
    let (pipeline, _device, mut peer, _proxy, mut probe) = start(config).await;

    let answer = lookup(&mut peer, 1, "ads.example.com.", RecordType::A).await;
    let fake = dns_answer_ip(&answer).expect("no address in answer");
    let pool: IpNet = "198.18.0.0/16".parse().unwrap();
    assert!(pool.contains(&fake));

    // The same name maps to the same address while the lease lives
    let again = lookup(&mut peer, 2, "ads.example.com.", RecordType::A).await;
    assert_eq!(dns_answer_ip(&again), Some(fake));

    let mut client = TcpClient::new("192.168.200.1:41000", SocketAddr::new(fake, 443), 300);
    peer.send(client.syn()).await.unwrap();
    let syn_ack = peer.recv_timeout(WAIT).await.expect("no SYN-ACK");
    peer.send(client.handshake(&syn_ack)).await.unwrap();

    let mut opened = probe.next_stream().await.expect("proxy not used");
    assert_eq!(opened.target, TargetAddr::domain("ads.example.com", 443));

    assert!(wait_for(|| pipeline.connections().len() == 1).await);
    let conn = &pipeline.connections()[0];
    assert_eq!(conn.handler, "proxy");
    assert_eq!(conn.protocol, Protocol::Tcp);
    assert_eq!(conn.target, TargetAddr::domain("ads.example.com", 443));

    opened.remote.write_all(b"hello").await.unwrap();
    let seen = recv_until(&mut peer, &mut client, |s| !s.payload.is_empty()).await;
    assert_eq!(seen.last().unwrap().payload, b"hello");

    let flows = pipeline.flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].verdict, Verdict::Proxy);

    let stats = pipeline.stats();
    assert_eq!(stats.fake_ip.allocations, 1);
    assert_eq!(stats.fake_ip.hits, 1);
    assert_eq!(stats.resolver.hijacked, 2);
    assert_eq!(stats.stack.dns_queries, 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_setup_configures_device() {
    let config = TestConfigBuilder::new()
        .proxy_cidrs(&["91.108.4.0/22"])
        .tun_addr(&["10.10.0.1/24", "fd00::1/64"])
        .build();
    let (pipeline, device, _peer, _proxy, _probe) = start(config).await;

    assert!(device.is_active());
    assert_eq!(
        device.addresses(),
        vec![
            "10.10.0.1/24".parse::<IpNet>().unwrap(),
            "fd00::1/64".parse().unwrap()
        ]
    );
    let routes = device.routes();
    assert!(routes.contains(&"91.108.4.0/22".parse().unwrap()));
    assert!(routes.contains(&"198.18.0.0/16".parse().unwrap()));

    pipeline.shutdown().await;
    assert!(device.is_closed());
}

/// Device whose route installation always fails, and optionally its
/// address assignment too
#[derive(Debug)]
struct FaultyDevice {
    inner: ChannelDevice,
    log: Arc<Mutex<Vec<&'static str>>>,
    reject_address: bool,
}

#[async_trait]
impl Device for FaultyDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mtu(&self) -> usize {
        self.inner.mtu()
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.inner.send(packet).await
    }

    async fn set_interface_address(&self, addr: IpNet) -> Result<()> {
        if self.reject_address {
            return Err(TunratsError::Device(format!("cannot assign {}", addr)));
        }
        self.inner.set_interface_address(addr).await
    }

    async fn activate(&self) -> Result<()> {
        self.inner.activate().await
    }

    async fn add_routes(&self, _routes: &[IpNet]) -> Result<()> {
        Err(TunratsError::Device("route table is read-only".into()))
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().push("device");
        self.inner.close().await
    }
}

/// Handler that only records when it is closed
#[derive(Debug)]
struct ClosingHandler {
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Handler for ClosingHandler {
    fn name(&self) -> &str {
        "closing"
    }

    async fn open_stream(
        &self,
        target: &TargetAddr,
    ) -> Result<Box<dyn tunrats::handler::StreamDyn>> {
        Err(TunratsError::Handler(format!("no streams to {}", target)))
    }

    async fn open_datagram(
        &self,
        target: &TargetAddr,
    ) -> Result<Box<dyn tunrats::handler::DatagramDyn>> {
        Err(TunratsError::Handler(format!("no datagrams to {}", target)))
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().push("handler");
        Ok(())
    }
}

#[tokio::test]
async fn test_setup_failure_releases_in_reverse_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (inner, _peer) = ChannelDevice::pair("tun-test", 1500);
    let device = Arc::new(FaultyDevice {
        inner,
        log: log.clone(),
        reject_address: false,
    });
    let handler = Arc::new(ClosingHandler { log: log.clone() });

    let err = Pipeline::start(TestConfigBuilder::new().build(), device.clone(), handler)
        .await
        .expect_err("route setup should fail");
    assert_eq!(err.stage(), Some(SetupStage::Routes));
    let message = err.to_string();
    assert!(message.starts_with("routes setup failed"), "{}", message);
    assert!(message.contains("read-only"), "{}", message);

    assert_eq!(*log.lock(), vec!["device", "handler"]);
    assert!(device.inner.is_closed());
}

#[tokio::test]
async fn test_device_stage_failure_closes_device() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (inner, _peer) = ChannelDevice::pair("tun-test", 1500);
    let device = Arc::new(FaultyDevice {
        inner,
        log: log.clone(),
        reject_address: true,
    });
    let handler = Arc::new(ClosingHandler { log: log.clone() });

    let err = Pipeline::start(TestConfigBuilder::new().build(), device.clone(), handler)
        .await
        .expect_err("address assignment should fail");
    assert_eq!(err.stage(), Some(SetupStage::Device));
    assert!(err.to_string().contains("cannot assign"), "{}", err);

    assert_eq!(*log.lock(), vec!["device", "handler"]);
    assert!(device.inner.is_closed());
    assert!(!device.inner.is_active());
}

#[tokio::test]
async fn test_invalid_config_fails_before_setup() {
    let mut config = TestConfigBuilder::new().build();
    config.fake_ip.ipv4_pool = "not-a-network".to_string();
    let (device, _peer) = ChannelDevice::pair("tun-test", 1500);
    let device = Arc::new(device);
    let (proxy, _probe) = MockHandler::new("proxy");

    let err = Pipeline::start(config, device.clone(), proxy.clone())
        .await
        .expect_err("config should be rejected");
    assert!(matches!(err, TunratsError::Config(_)));
    assert!(!device.is_active());
    assert!(!proxy.is_closed());
}

#[tokio::test]
async fn test_udp_bypass_goes_out_directly() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });

    let config = TestConfigBuilder::new().final_ip(Verdict::Proxy).build();
    let (pipeline, _device, mut peer, proxy, _probe) = start(config).await;

    peer.send(udp_packet("192.168.200.1:6000", echo_addr, b"ping"))
        .await
        .unwrap();
    let reply = peer.recv_timeout(WAIT).await.expect("no echo");
    let (src, dst, payload) = parse_datagram(&reply);
    assert_eq!(src, echo_addr);
    assert_eq!(dst, "192.168.200.1:6000".parse::<SocketAddr>().unwrap());
    assert_eq!(payload, b"ping");

    // Loopback is private, so it bypasses even with a proxy default
    assert!(proxy.opened().is_empty());
    let conns = pipeline.connections();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].handler, "direct");
    assert_eq!(conns[0].protocol, Protocol::Udp);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_cidr_rules_match_at_boundaries() {
    let config = TestConfigBuilder::new()
        .proxy_cidrs(&["10.1.0.0/16", "2001:db8::/32"])
        .final_ip(Verdict::Bypass)
        .build();
    let (pipeline, _device, _peer, _proxy, _probe) = start(config).await;

    let verdict = |ip: &str| pipeline.classify_target(&TargetAddr::ip(ip.parse().unwrap(), 443));
    assert_eq!(verdict("10.1.0.0"), Verdict::Proxy);
    assert_eq!(verdict("10.1.255.255"), Verdict::Proxy);
    assert_eq!(verdict("10.0.255.255"), Verdict::Bypass);
    assert_eq!(verdict("10.2.0.0"), Verdict::Bypass);
    assert_eq!(verdict("2001:db8::"), Verdict::Proxy);
    assert_eq!(verdict("2001:db8:ffff:ffff:ffff:ffff:ffff:ffff"), Verdict::Proxy);
    assert_eq!(verdict("2001:db9::"), Verdict::Bypass);
    assert_eq!(verdict("8.8.8.8"), Verdict::Bypass);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_reload_rules_takes_effect() {
    let config = TestConfigBuilder::new()
        .proxy_domains(&["old.example"])
        .build();
    let (pipeline, _device, _peer, _proxy, _probe) = start(config).await;
    let target = |d: &str| TargetAddr::domain(d, 443);

    assert_eq!(pipeline.classify_target(&target("www.old.example")), Verdict::Proxy);
    assert_eq!(pipeline.classify_target(&target("new.example")), Verdict::Bypass);

    pipeline.reload_rules(&DomainRulesConfig {
        proxy: vec!["new.example".to_string()],
        blocked: vec!["old.example".to_string()],
        ..Default::default()
    });
    assert_eq!(pipeline.classify_target(&target("www.old.example")), Verdict::Block);
    assert_eq!(pipeline.classify_target(&target("new.example")), Verdict::Proxy);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_blocked_domain_gets_nxdomain() {
    let config = TestConfigBuilder::new()
        .blocked_domains(&["tracker.example"])
        .build();
    let (pipeline, _device, mut peer, _proxy, _probe) = start(config).await;

    let answer = lookup(&mut peer, 9, "pixel.tracker.example.", RecordType::A).await;
    assert_eq!(dns_response_code(&answer), ResponseCode::NXDomain);
    assert!(dns_answer_ip(&answer).is_none());
    assert_eq!(pipeline.stats().resolver.blocked, 1);
    assert_eq!(pipeline.stats().fake_ip.leased, 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_disabled_hijack_forwards_to_upstream() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let received = Arc::new(Mutex::new(0usize));
    {
        let received = received.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = upstream.recv_from(&mut buf).await {
                *received.lock() += 1;
                let _ = upstream.send_to(&buf[..n], from).await;
            }
        });
    }

    let config = TestConfigBuilder::new()
        .proxy_domains(&["example.com"])
        .name_server(&format!("udp://{}", upstream_addr))
        .disable_hijack()
        .build();
    let (pipeline, _device, mut peer, _proxy, _probe) = start(config).await;

    let query = dns_query(77, "www.example.com.", RecordType::A);
    let answer = lookup(&mut peer, 77, "www.example.com.", RecordType::A).await;
    assert_eq!(answer, query);
    assert_eq!(*received.lock(), 1);
    assert_eq!(pipeline.stats().fake_ip.allocations, 0);
    assert_eq!(pipeline.stats().resolver.forwarded, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let (pipeline, device, mut peer, proxy, _probe) = start(TestConfigBuilder::new().build()).await;
    let extra = Arc::new(Mutex::new(false));
    {
        let extra = extra.clone();
        pipeline.attach_closer("extra", move || async move {
            *extra.lock() = true;
            Ok(())
        });
    }

    // An open flow is torn down on shutdown
    let dst: SocketAddr = "93.184.216.34:80".parse().unwrap();
    let mut client = TcpClient::new("192.168.200.1:42000", dst, 1);
    peer.send(client.syn()).await.unwrap();
    let syn_ack = peer.recv_timeout(WAIT).await.unwrap();
    peer.send(client.handshake(&syn_ack)).await.unwrap();
    assert!(wait_for(|| pipeline.flows().len() == 1).await);

    pipeline.shutdown().await;
    tokio::time::timeout(WAIT, pipeline.stopped()).await.unwrap();

    assert!(*extra.lock());
    assert!(proxy.is_closed());
    assert!(device.is_closed());
    assert!(pipeline.flows().is_empty());
}

#[tokio::test]
async fn test_device_loss_stops_pipeline() {
    let (pipeline, _device, peer, _proxy, _probe) = start(TestConfigBuilder::new().build()).await;
    drop(peer);
    tokio::time::timeout(WAIT, pipeline.stopped()).await.unwrap();
    pipeline.shutdown().await;
}

#[test]
fn test_fake_pool_is_not_private() {
    let ip: IpAddr = "198.18.0.1".parse().unwrap();
    let filter = tunrats::filter::IpFilter::new(Verdict::Proxy);
    filter.ignore_private();
    assert_eq!(filter.classify(ip), Verdict::Proxy);
}
