//! Direct egress

use super::{DatagramDyn, Handler, SocketOpts, StreamDyn};
use crate::error::{Result, TunratsError};
use crate::route::TargetAddr;
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Handler that connects straight to the destination
#[derive(Debug, Clone)]
pub struct DirectHandler {
    opts: SocketOpts,
    timeout: Duration,
}

impl DirectHandler {
    /// Create a direct handler
    pub fn new(opts: SocketOpts, timeout: Duration) -> Self {
        DirectHandler { opts, timeout }
    }

    async fn resolve(&self, target: &TargetAddr) -> Result<SocketAddr> {
        tokio::time::timeout(self.timeout, target.resolve())
            .await
            .map_err(|_| TunratsError::Handler(format!("resolving {} timed out", target)))?
            .map_err(|e| TunratsError::Handler(format!("{:#}", e)))
    }
}

impl Default for DirectHandler {
    fn default() -> Self {
        Self::new(
            SocketOpts::default(),
            Duration::from_secs(crate::helper::DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }
}

#[async_trait]
impl Handler for DirectHandler {
    fn name(&self) -> &str {
        "direct"
    }

    async fn open_stream(&self, target: &TargetAddr) -> Result<Box<dyn StreamDyn>> {
        let addr = self.resolve(target).await?;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TunratsError::Handler(format!("connect to {} timed out", target)))??;
        self.opts.apply(&stream)?;
        debug!("Direct connection to {} ({})", target, addr);
        Ok(Box::new(stream))
    }

    async fn open_datagram(&self, target: &TargetAddr) -> Result<Box<dyn DatagramDyn>> {
        let addr = self.resolve(target).await?;
        let bind: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        debug!("Direct datagram channel to {} ({})", target, addr);
        Ok(Box::new(DirectDatagram { socket }))
    }
}

/// Connected UDP socket
#[derive(Debug)]
struct DirectDatagram {
    socket: UdpSocket,
}

#[async_trait]
impl DatagramDyn for DirectDatagram {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send(payload).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let handler = DirectHandler::default();
        let mut stream = handler.open_stream(&TargetAddr::Ip(addr)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_direct_datagram() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], peer).await.unwrap();
        });

        let handler = DirectHandler::default();
        let dgram = handler.open_datagram(&TargetAddr::Ip(addr)).await.unwrap();
        dgram.send(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let n = dgram.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_direct_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handler = DirectHandler::default();
        assert!(handler.open_stream(&TargetAddr::Ip(addr)).await.is_err());
    }
}
