//! HTTP CONNECT upstream

use super::{connect_tcp, upstream_endpoint, DatagramDyn, Handler, SocketOpts, StreamDyn};
use crate::error::{Result, TunratsError};
use crate::route::TargetAddr;
use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Tunnel handler using HTTP CONNECT; streams only
#[derive(Clone)]
pub struct HttpHandler {
    server: String,
    credentials: Option<(String, String)>,
    opts: SocketOpts,
    timeout: Duration,
}

impl fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHandler")
            .field("server", &self.server)
            .field("auth", &self.credentials.is_some())
            .finish()
    }
}

impl HttpHandler {
    /// Create a handler for `server` (`host:port`)
    pub fn new(
        server: impl Into<String>,
        credentials: Option<(String, String)>,
        opts: SocketOpts,
        timeout: Duration,
    ) -> Self {
        HttpHandler {
            server: server.into(),
            credentials,
            opts,
            timeout,
        }
    }

    /// Create a handler from an `http://[user:pass@]host:port` URL
    pub fn from_url(url: &Url, opts: SocketOpts, timeout: Duration) -> Result<Self> {
        let (server, credentials) = upstream_endpoint(url)?;
        Ok(Self::new(server, credentials, opts, timeout))
    }
}

#[async_trait]
impl Handler for HttpHandler {
    fn name(&self) -> &str {
        "http"
    }

    async fn open_stream(&self, target: &TargetAddr) -> Result<Box<dyn StreamDyn>> {
        let mut stream = connect_tcp(&self.server, &self.opts, self.timeout).await?;
        let host = target.host();
        let port = target.port();
        let handshake = async {
            match &self.credentials {
                Some((user, pass)) => {
                    http_connect_tokio_with_basic_auth(&mut stream, &host, port, user, pass).await
                }
                None => http_connect_tokio(&mut stream, &host, port).await,
            }
        };
        tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| TunratsError::Handler(format!("CONNECT to {} timed out", target)))?
            .map_err(|e| {
                TunratsError::Handler(format!("CONNECT to {} failed: {}", target, e))
            })?;
        debug!("HTTP tunnel to {} via {}", target, self.server);
        Ok(Box::new(stream))
    }

    async fn open_datagram(&self, target: &TargetAddr) -> Result<Box<dyn DatagramDyn>> {
        Err(TunratsError::Handler(format!(
            "http upstream cannot carry datagrams to {}",
            target
        )))
    }
}
