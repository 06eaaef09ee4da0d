//! Logical flow destination

use anyhow::{Context, Result};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Destination a handler connects to
///
/// A flow toward a fake address carries the domain it was leased for, so
/// the handler resolves the name itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// Create a new TargetAddr from an IP address and port
    pub fn ip(ip: IpAddr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(ip, port))
    }

    /// Create a new TargetAddr from a domain name and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        TargetAddr::Domain(domain.into(), port)
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Host part as a string
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    /// Domain name, if this is one
    pub fn as_domain(&self) -> Option<&str> {
        match self {
            TargetAddr::Domain(domain, _) => Some(domain),
            TargetAddr::Ip(_) => None,
        }
    }

    /// Resolve the address to a SocketAddr
    ///
    /// For IP addresses, this returns immediately.
    /// For domain names, this performs DNS resolution.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(domain, port) => {
                let resolved = tokio::net::lookup_host((domain.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to resolve domain: {}", domain))?
                    .next()
                    .with_context(|| format!("No addresses found for domain: {}", domain))?;
                Ok(resolved)
            }
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
