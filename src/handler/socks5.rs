//! SOCKS5 upstream

use super::{connect_tcp, upstream_endpoint, DatagramDyn, Handler, SocketOpts, StreamDyn};
use crate::error::{Result, TunratsError};
use crate::route::TargetAddr;
use async_socks5::{AddrKind, Auth, SocksDatagram};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;
use url::Url;

fn addr_kind(target: &TargetAddr) -> AddrKind {
    match target {
        TargetAddr::Ip(addr) => AddrKind::Ip(*addr),
        TargetAddr::Domain(domain, port) => AddrKind::Domain(domain.clone(), *port),
    }
}

fn socks_error(target: &TargetAddr, e: async_socks5::Error) -> TunratsError {
    TunratsError::Handler(format!("socks5 request for {} failed: {}", target, e))
}

/// Tunnel handler speaking SOCKS5 to an upstream proxy
#[derive(Clone)]
pub struct Socks5Handler {
    server: String,
    auth: Option<Auth>,
    opts: SocketOpts,
    timeout: Duration,
}

impl fmt::Debug for Socks5Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Handler")
            .field("server", &self.server)
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

impl Socks5Handler {
    /// Create a handler for `server` (`host:port`)
    pub fn new(
        server: impl Into<String>,
        credentials: Option<(String, String)>,
        opts: SocketOpts,
        timeout: Duration,
    ) -> Self {
        Socks5Handler {
            server: server.into(),
            auth: credentials.map(|(username, password)| Auth { username, password }),
            opts,
            timeout,
        }
    }

    /// Create a handler from a `socks5://[user:pass@]host:port` URL
    pub fn from_url(url: &Url, opts: SocketOpts, timeout: Duration) -> Result<Self> {
        let (server, credentials) = upstream_endpoint(url)?;
        Ok(Self::new(server, credentials, opts, timeout))
    }

    async fn control(&self) -> Result<TcpStream> {
        connect_tcp(&self.server, &self.opts, self.timeout).await
    }
}

#[async_trait]
impl Handler for Socks5Handler {
    fn name(&self) -> &str {
        "socks5"
    }

    async fn open_stream(&self, target: &TargetAddr) -> Result<Box<dyn StreamDyn>> {
        let mut stream = self.control().await?;
        tokio::time::timeout(
            self.timeout,
            async_socks5::connect(&mut stream, addr_kind(target), self.auth.clone()),
        )
        .await
        .map_err(|_| TunratsError::Handler(format!("socks5 connect to {} timed out", target)))?
        .map_err(|e| socks_error(target, e))?;
        debug!("SOCKS5 stream to {} via {}", target, self.server);
        Ok(Box::new(stream))
    }

    async fn open_datagram(&self, target: &TargetAddr) -> Result<Box<dyn DatagramDyn>> {
        let stream = self.control().await?;
        let bind: SocketAddr = match stream.peer_addr()? {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        let inner = tokio::time::timeout(
            self.timeout,
            SocksDatagram::associate(stream, socket, self.auth.clone(), None::<AddrKind>),
        )
        .await
        .map_err(|_| TunratsError::Handler(format!("socks5 associate for {} timed out", target)))?
        .map_err(|e| socks_error(target, e))?;
        debug!("SOCKS5 association for {} via {}", target, self.server);
        Ok(Box::new(Socks5Datagram {
            inner,
            target: target.clone(),
        }))
    }
}

/// UDP association relaying to one target
struct Socks5Datagram {
    inner: SocksDatagram<TcpStream>,
    target: TargetAddr,
}

impl fmt::Debug for Socks5Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Datagram")
            .field("target", &self.target)
            .finish()
    }
}

fn to_io(e: async_socks5::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[async_trait]
impl DatagramDyn for Socks5Datagram {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.inner
            .send_to(payload, addr_kind(&self.target))
            .await
            .map(|_| ())
            .map_err(to_io)
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _from) = self.inner.recv_from(buf).await.map_err(to_io)?;
        Ok(n)
    }
}
