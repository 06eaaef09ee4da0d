//! Upstream, interface and stack configuration types

use crate::error::{Result, TunratsError};
use crate::helper::{duration_from_secs, DEFAULT_CONNECT_TIMEOUT_SECS};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default connect timeout in seconds
fn default_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// Tunnel upstream configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Upstream URL: `socks5://[user:pass@]host:port`, `http://...` or
    /// `direct://`. Absent means every proxied flow egresses directly.
    #[serde(default)]
    pub url: Option<String>,

    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Enable TCP_NODELAY on outbound sockets
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

fn default_nodelay() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            url: None,
            timeout: default_timeout(),
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

impl ServerConfig {
    /// Parsed upstream URL
    pub fn parsed_url(&self) -> Result<Option<Url>> {
        let Some(raw) = self.url.as_deref() else {
            return Ok(None);
        };
        let url = Url::parse(raw)
            .map_err(|e| TunratsError::Config(format!("invalid server url {}: {}", raw, e)))?;
        match url.scheme() {
            "socks5" | "socks5h" | "http" | "direct" => Ok(Some(url)),
            other => Err(TunratsError::Config(format!(
                "unsupported server scheme: {}",
                other
            ))),
        }
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        duration_from_secs(self.timeout)
    }
}

fn default_tun_name() -> String {
    "utun".to_string()
}

fn default_tun_addr() -> Vec<String> {
    vec!["192.168.200.1/24".to_string()]
}

fn default_mtu() -> u16 {
    2044
}

/// Virtual interface configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunConfig {
    /// Interface name
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// Addresses assigned to the interface, in CIDR notation
    #[serde(default = "default_tun_addr")]
    pub addr: Vec<String>,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        TunConfig {
            name: default_tun_name(),
            addr: default_tun_addr(),
            mtu: default_mtu(),
        }
    }
}

impl TunConfig {
    /// Parsed interface addresses
    pub fn addresses(&self) -> Result<Vec<IpNet>> {
        self.addr
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpNet>()
                    .map_err(|e| TunratsError::Config(format!("invalid tun addr {}: {}", s, e)))
            })
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mtu < 576 {
            return Err(TunratsError::Config(format!(
                "tun mtu {} is below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        self.addresses().map(|_| ())
    }
}

/// What the stack does when a flow's queue toward the dispatcher is full
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Wait for the queue to drain, stalling the reader
    #[default]
    Block,
    /// Discard the packet; TCP data is left unacknowledged
    Drop,
}

fn default_tcp_idle_timeout() -> u64 {
    300
}

fn default_udp_idle_timeout() -> u64 {
    60
}

fn default_reassembly_window() -> usize {
    256 * 1024
}

fn default_flow_queue() -> usize {
    64
}

fn default_verify_checksums() -> bool {
    true
}

fn default_max_flows() -> usize {
    16384
}

fn default_sweep_interval() -> u64 {
    5
}

/// Packet-to-flow stack tuning
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StackConfig {
    /// Idle timeout for TCP flows in seconds
    #[serde(default = "default_tcp_idle_timeout")]
    pub tcp_idle_timeout: u64,

    /// Idle timeout for UDP flows in seconds
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout: u64,

    /// Bytes of out-of-order data buffered per TCP flow
    #[serde(default = "default_reassembly_window")]
    pub reassembly_window: usize,

    /// Messages queued per flow toward the dispatcher
    #[serde(default = "default_flow_queue")]
    pub flow_queue: usize,

    /// Policy for a full flow queue
    #[serde(default)]
    pub backpressure: Backpressure,

    /// Verify IPv4 header and TCP/UDP checksums on inbound packets
    #[serde(default = "default_verify_checksums")]
    pub verify_checksums: bool,

    /// Upper bound on concurrently tracked flows
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    /// Seconds between idle sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            tcp_idle_timeout: default_tcp_idle_timeout(),
            udp_idle_timeout: default_udp_idle_timeout(),
            reassembly_window: default_reassembly_window(),
            flow_queue: default_flow_queue(),
            backpressure: Backpressure::default(),
            verify_checksums: default_verify_checksums(),
            max_flows: default_max_flows(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl StackConfig {
    /// TCP idle timeout
    pub fn tcp_idle(&self) -> Duration {
        duration_from_secs(self.tcp_idle_timeout)
    }

    /// UDP idle timeout
    pub fn udp_idle(&self) -> Duration {
        duration_from_secs(self.udp_idle_timeout)
    }

    /// Interval between sweeps, never zero
    pub fn sweep_every(&self) -> Duration {
        duration_from_secs(self.sweep_interval.max(1))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.flow_queue == 0 {
            return Err(TunratsError::Config("stack.flow_queue must be positive".into()));
        }
        if self.max_flows == 0 {
            return Err(TunratsError::Config("stack.max_flows must be positive".into()));
        }
        if self.reassembly_window == 0 {
            return Err(TunratsError::Config(
                "stack.reassembly_window must be positive".into(),
            ));
        }
        Ok(())
    }
}
