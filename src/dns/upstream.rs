//! Upstream DNS transports

use super::NameServer;
use crate::error::{Result, TunratsError};
use crate::helper::RetryConfig;
use async_trait::async_trait;
use std::fmt::Debug;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Largest response accepted over UDP
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Raw DNS message exchange with an upstream server
#[async_trait]
pub trait Upstream: Debug + Send + Sync {
    /// Send a raw query and return the raw answer
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>>;
}

fn transaction_id(message: &[u8]) -> Result<u16> {
    match message {
        [a, b, ..] => Ok(u16::from_be_bytes([*a, *b])),
        _ => Err(TunratsError::Dns("message shorter than a header".into())),
    }
}

/// Plain UDP upstream; one socket per query
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    server: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    /// Create a UDP upstream
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        UdpUpstream { server, timeout }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        let id = transaction_id(message)?;
        let bind = if self.server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;
        socket.send(message).await?;

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let exchange = async {
            loop {
                let n = socket.recv(&mut buf).await?;
                // Stray or late answers for other queries are skipped.
                if n >= 2 && transaction_id(&buf[..n])? == id {
                    return Ok::<_, TunratsError>(buf[..n].to_vec());
                }
                debug!("Ignoring DNS answer with mismatched id from {}", self.server);
            }
        };
        timeout(self.timeout, exchange).await.map_err(|_| {
            TunratsError::Dns(format!("query to {} timed out", self.server))
        })?
    }
}

/// DNS over TCP with two-byte length framing
#[derive(Debug, Clone)]
pub struct TcpUpstream {
    server: SocketAddr,
    timeout: Duration,
}

impl TcpUpstream {
    /// Create a TCP upstream
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        TcpUpstream { server, timeout }
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        let id = transaction_id(message)?;
        let len = u16::try_from(message.len())
            .map_err(|_| TunratsError::Dns("query too large for tcp framing".into()))?;

        let exchange = async {
            let mut stream = TcpStream::connect(self.server).await?;
            stream.set_nodelay(true)?;
            let mut framed = Vec::with_capacity(message.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(message);
            stream.write_all(&framed).await?;

            let answer_len = stream.read_u16().await? as usize;
            let mut answer = vec![0u8; answer_len];
            stream.read_exact(&mut answer).await?;
            Ok::<_, TunratsError>(answer)
        };
        let answer = timeout(self.timeout, exchange).await.map_err(|_| {
            TunratsError::Dns(format!("query to {} timed out", self.server))
        })??;

        if transaction_id(&answer)? != id {
            return Err(TunratsError::Dns(format!(
                "answer from {} has mismatched id",
                self.server
            )));
        }
        Ok(answer)
    }
}

/// Ordered list of upstreams tried one after another
#[derive(Debug)]
pub struct UpstreamSet {
    servers: Vec<Box<dyn Upstream>>,
    retry: RetryConfig,
}

impl UpstreamSet {
    /// Build from configured name servers
    pub fn from_servers(servers: &[NameServer], query_timeout: Duration) -> Result<Self> {
        if servers.is_empty() {
            return Err(TunratsError::Config("no name server configured".into()));
        }
        let servers = servers
            .iter()
            .map(|s| -> Box<dyn Upstream> {
                match s {
                    NameServer::Udp(addr) => Box::new(UdpUpstream::new(*addr, query_timeout)),
                    NameServer::Tcp(addr) => Box::new(TcpUpstream::new(*addr, query_timeout)),
                }
            })
            .collect();
        Ok(UpstreamSet {
            servers,
            retry: RetryConfig::new(1),
        })
    }

    /// Build from arbitrary upstreams
    pub fn new(servers: Vec<Box<dyn Upstream>>, retry: RetryConfig) -> Self {
        UpstreamSet { servers, retry }
    }
}

#[async_trait]
impl Upstream for UpstreamSet {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut last_err = TunratsError::Dns("no name server configured".into());
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
            }
            for server in &self.servers {
                match server.query(message).await {
                    Ok(answer) => return Ok(answer),
                    Err(e) => {
                        warn!("Upstream DNS query failed: {}", e);
                        last_err = e;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_upstream_skips_mismatched_id() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let mut stray = buf[..n].to_vec();
            stray[0] ^= 0xff;
            server.send_to(&stray, peer).await.unwrap();
            let mut answer = buf[..n].to_vec();
            answer.push(0xaa);
            server.send_to(&answer, peer).await.unwrap();
        });

        let upstream = UdpUpstream::new(addr, Duration::from_secs(2));
        let answer = upstream.query(&[0x12, 0x34, 1, 2]).await.unwrap();
        assert_eq!(answer, vec![0x12, 0x34, 1, 2, 0xaa]);
    }

    #[tokio::test]
    async fn test_udp_upstream_timeout() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpUpstream::new(server.local_addr().unwrap(), Duration::from_millis(50));
        let err = upstream.query(&[0, 1, 2]).await.unwrap_err();
        assert!(matches!(err, TunratsError::Dns(_)));
    }

    #[tokio::test]
    async fn test_tcp_upstream_framing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let len = conn.read_u16().await.unwrap() as usize;
            let mut query = vec![0u8; len];
            conn.read_exact(&mut query).await.unwrap();
            query.extend_from_slice(b"ok");
            conn.write_u16(query.len() as u16).await.unwrap();
            conn.write_all(&query).await.unwrap();
        });

        let upstream = TcpUpstream::new(addr, Duration::from_secs(2));
        let answer = upstream.query(&[0xbe, 0xef, 9]).await.unwrap();
        assert_eq!(answer, vec![0xbe, 0xef, 9, b'o', b'k']);
    }

    #[tokio::test]
    async fn test_upstream_set_falls_through() {
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let live = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = live.recv_from(&mut buf).await.unwrap();
            live.send_to(&buf[..n], peer).await.unwrap();
        });

        let set = UpstreamSet::new(
            vec![
                Box::new(UdpUpstream::new(dead.local_addr().unwrap(), Duration::from_millis(50))),
                Box::new(UdpUpstream::new(live_addr, Duration::from_secs(2))),
            ],
            RetryConfig::new(0),
        );
        assert_eq!(set.query(&[7, 7, 7]).await.unwrap(), vec![7, 7, 7]);
    }

    #[test]
    fn test_upstream_set_requires_servers() {
        assert!(UpstreamSet::from_servers(&[], Duration::from_secs(1)).is_err());
    }
}
