//! DNS interception
//!
//! [`Resolver`] answers hijackable queries from the fake address pool and
//! relays everything else through an [`Upstream`].

mod resolver;
mod upstream;

pub use resolver::{Resolver, ResolverStats, ResolverStatsSnapshot};
pub use upstream::{TcpUpstream, UdpUpstream, Upstream, UpstreamSet};

use crate::error::TunratsError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// DNS port
pub const DNS_PORT: u16 = 53;

/// Configured upstream name server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameServer {
    /// Plain UDP
    Udp(SocketAddr),
    /// DNS over TCP
    Tcp(SocketAddr),
}

impl NameServer {
    /// Server address
    pub fn addr(&self) -> SocketAddr {
        match self {
            NameServer::Udp(addr) | NameServer::Tcp(addr) => *addr,
        }
    }
}

impl FromStr for NameServer {
    type Err = TunratsError;

    /// Accepts `udp://ip[:port]`, `tcp://ip[:port]` or a bare `ip[:port]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (tcp, rest) = if let Some(rest) = s.strip_prefix("tcp://") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("udp://") {
            (false, rest)
        } else if s.contains("://") {
            return Err(TunratsError::Config(format!(
                "unsupported name server scheme: {}",
                s
            )));
        } else {
            (false, s)
        };
        let rest = rest.trim_end_matches('/');

        let addr = rest
            .parse::<SocketAddr>()
            .or_else(|_| {
                rest.trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, DNS_PORT))
            })
            .map_err(|_| TunratsError::Config(format!("invalid name server: {}", s)))?;

        Ok(if tcp {
            NameServer::Tcp(addr)
        } else {
            NameServer::Udp(addr)
        })
    }
}

impl fmt::Display for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameServer::Udp(addr) => write!(f, "udp://{}", addr),
            NameServer::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}
