//! Flow dispatcher
//!
//! Opens the outbound side of a classified flow through the proxy or the
//! direct handler and bridges the two until either side finishes. Both
//! sides are owned by the bridging future, so every exit drops and closes
//! them.

use crate::handler::{DatagramDyn, Handler};
use crate::helper::{copy_bidirectional, MAX_PACKET_SIZE};
use crate::route::Route;
use crate::rules::Verdict;
use crate::stack::{FlowDatagram, FlowStream};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Routes flows to the proxy or direct handler
#[derive(Debug, Clone)]
pub struct Dispatcher {
    proxy: Arc<dyn Handler>,
    direct: Arc<dyn Handler>,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(proxy: Arc<dyn Handler>, direct: Arc<dyn Handler>) -> Self {
        Dispatcher { proxy, direct }
    }

    /// Handler for the proxy path
    pub fn proxy(&self) -> &Arc<dyn Handler> {
        &self.proxy
    }

    /// Handler for the bypass path
    pub fn direct(&self) -> &Arc<dyn Handler> {
        &self.direct
    }

    fn handler_for(&self, verdict: Verdict) -> Option<&Arc<dyn Handler>> {
        match verdict {
            Verdict::Proxy => Some(&self.proxy),
            Verdict::Bypass => Some(&self.direct),
            Verdict::Block => None,
        }
    }

    /// Bridge a TCP flow until it finishes or `cancel` fires
    ///
    /// If the outbound stream cannot be opened the flow is aborted, which
    /// resets the local connection.
    pub async fn dispatch_stream(
        &self,
        mut stream: FlowStream,
        route: Route,
        cancel: CancellationToken,
    ) {
        let key = *stream.key();
        let Some(handler) = self.handler_for(route.verdict) else {
            stream.abort();
            return;
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = handler.open_stream(&route.target) => opened,
        };
        let mut remote = match opened {
            Ok(remote) => remote,
            Err(e) => {
                warn!(
                    "Failed to open {} via {} for {}: {}",
                    route.target,
                    handler.name(),
                    key,
                    e
                );
                stream.abort();
                return;
            }
        };
        debug!("Bridging {} to {} via {}", key, route.target, handler.name());

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Flow {} cancelled", key);
                return;
            }
            result = copy_bidirectional(&mut stream, &mut remote) => result,
        };
        match result {
            Ok((up, down)) => debug!("Flow {} finished: {} up, {} down", key, up, down),
            Err(e) => {
                debug!("Flow {} bridge error: {}", key, e);
                stream.abort();
            }
        }
    }

    /// Bridge a UDP flow until it finishes or `cancel` fires
    pub async fn dispatch_datagram(
        &self,
        mut dgram: FlowDatagram,
        route: Route,
        cancel: CancellationToken,
    ) {
        let key = *dgram.key();
        let Some(handler) = self.handler_for(route.verdict) else {
            return;
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = handler.open_datagram(&route.target) => opened,
        };
        let remote = match opened {
            Ok(remote) => remote,
            Err(e) => {
                warn!(
                    "Failed to open {} via {} for {}: {}",
                    route.target,
                    handler.name(),
                    key,
                    e
                );
                return;
            }
        };
        debug!("Relaying {} to {} via {}", key, route.target, handler.name());

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = relay_datagrams(&mut dgram, remote.as_ref()) => result,
        };
        match result {
            Ok(()) => debug!("Flow {} relay finished", key),
            Err(e) => debug!("Flow {} relay error: {}", key, e),
        }
    }
}

async fn relay_datagrams(dgram: &mut FlowDatagram, remote: &dyn DatagramDyn) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        tokio::select! {
            local = dgram.recv() => match local {
                Some(payload) => remote.send(&payload).await?,
                None => return Ok(()),
            },
            n = remote.recv(&mut buf) => dgram.send(&buf[..n?]).await?,
        }
    }
}
