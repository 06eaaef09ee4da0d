//! Address pool and rule configuration types

use crate::error::{Result, TunratsError};
use crate::helper::duration_from_secs;
use crate::rules::Verdict;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_ipv4_pool() -> String {
    "198.18.0.0/16".to_string()
}

fn default_lease_ttl() -> u64 {
    120
}

/// Fake address pool configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FakeIpConfig {
    /// IPv4 pool in CIDR notation
    #[serde(default = "default_ipv4_pool")]
    pub ipv4_pool: String,

    /// Optional IPv6 pool; without it AAAA queries get an empty answer
    #[serde(default)]
    pub ipv6_pool: Option<String>,

    /// Lease lifetime in seconds, also used as the DNS answer TTL
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: u64,
}

impl Default for FakeIpConfig {
    fn default() -> Self {
        FakeIpConfig {
            ipv4_pool: default_ipv4_pool(),
            ipv6_pool: None,
            lease_ttl: default_lease_ttl(),
        }
    }
}

impl FakeIpConfig {
    /// Parsed IPv4 pool
    pub fn ipv4_net(&self) -> Result<Ipv4Net> {
        self.ipv4_pool.trim().parse::<Ipv4Net>().map_err(|e| {
            TunratsError::Config(format!("invalid ipv4_pool {}: {}", self.ipv4_pool, e))
        })
    }

    /// Parsed IPv6 pool, if configured
    pub fn ipv6_net(&self) -> Result<Option<Ipv6Net>> {
        self.ipv6_pool
            .as_deref()
            .map(|s| {
                s.trim()
                    .parse::<Ipv6Net>()
                    .map_err(|e| TunratsError::Config(format!("invalid ipv6_pool {}: {}", s, e)))
            })
            .transpose()
    }

    /// Every configured pool as a generic network
    pub fn pools(&self) -> Result<Vec<IpNet>> {
        let mut pools = vec![IpNet::V4(self.ipv4_net()?)];
        if let Some(v6) = self.ipv6_net()? {
            pools.push(IpNet::V6(v6));
        }
        Ok(pools)
    }

    /// Lease lifetime
    pub fn lease_duration(&self) -> Duration {
        duration_from_secs(self.lease_ttl)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl == 0 {
            return Err(TunratsError::Config("fake_ip.lease_ttl must be positive".into()));
        }
        self.pools().map(|_| ())
    }
}

/// Domain rule lists
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DomainRulesConfig {
    /// Domains routed through the tunnel
    #[serde(default)]
    pub proxy: Vec<String>,

    /// Domains sent directly
    #[serde(default)]
    pub direct: Vec<String>,

    /// Domains dropped
    #[serde(default)]
    pub blocked: Vec<String>,

    /// Verdict for domains no rule matches
    #[serde(rename = "final", default)]
    pub final_verdict: Verdict,

    /// Forward every DNS query upstream untouched
    #[serde(default)]
    pub disable_hijack: bool,
}

impl DomainRulesConfig {
    /// Whether DNS hijacking is active
    pub fn hijack(&self) -> bool {
        !self.disable_hijack
    }
}

/// Explicit CIDR rule lists
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct IpCidrRulesConfig {
    /// Ranges routed through the tunnel
    #[serde(default)]
    pub proxy: Vec<String>,

    /// Ranges sent directly
    #[serde(default)]
    pub direct: Vec<String>,
}

impl IpCidrRulesConfig {
    /// Parsed proxy ranges
    pub fn proxy_nets(&self) -> Result<Vec<IpNet>> {
        parse_nets(&self.proxy)
    }

    /// Parsed direct ranges
    pub fn direct_nets(&self) -> Result<Vec<IpNet>> {
        parse_nets(&self.direct)
    }
}

/// Parse CIDRs, accepting bare addresses as host routes
pub fn parse_nets(items: &[String]) -> Result<Vec<IpNet>> {
    items.iter().map(|s| parse_net(s)).collect()
}

/// Parse one CIDR or bare address
pub fn parse_net(s: &str) -> Result<IpNet> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    s.parse::<std::net::IpAddr>()
        .map(IpNet::from)
        .map_err(|_| TunratsError::Config(format!("invalid cidr: {}", s)))
}

/// GeoIP configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeoIpConfig {
    /// Path to a `<cidr> <country>` database
    #[serde(default)]
    pub file: Option<String>,

    /// Country codes routed through the tunnel
    #[serde(default)]
    pub proxy: Vec<String>,

    /// Country codes sent directly
    #[serde(default)]
    pub bypass: Vec<String>,

    /// Verdict for addresses no CIDR or country rule matches
    #[serde(rename = "final", default)]
    pub final_verdict: Verdict,
}

impl GeoIpConfig {
    /// Whether any country rule is configured
    pub fn enabled(&self) -> bool {
        !self.proxy.is_empty() || !self.bypass.is_empty()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.enabled() && self.file.is_none() {
            return Err(TunratsError::Config(
                "geo_ip country rules require geo_ip.file".into(),
            ));
        }
        Ok(())
    }
}

/// Process rule lists
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppRulesConfig {
    /// Executable names whose traffic is captured and proxied
    #[serde(default)]
    pub proxy: Vec<String>,
}
