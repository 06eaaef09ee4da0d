//! Configuration module for Tunrats
//!
//! This module provides configuration types and parsing for the client.

mod network;
mod rules;

pub use network::{Backpressure, ServerConfig, StackConfig, TunConfig};
pub use rules::{
    parse_net, parse_nets, AppRulesConfig, DomainRulesConfig, FakeIpConfig, GeoIpConfig,
    IpCidrRulesConfig,
};

use crate::dns::NameServer;
use crate::error::{Result as TunratsResult, TunratsError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable holding live process ids for the process filter
pub const PIDS_ENV: &str = "TUNRATS_PIDS";

fn default_name_server() -> Vec<String> {
    vec!["udp://1.1.1.1:53".to_string()]
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Tunnel upstream
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream DNS servers, tried in order
    #[serde(default = "default_name_server")]
    pub name_server: Vec<String>,

    /// Virtual interface
    #[serde(default)]
    pub tun: TunConfig,

    /// Fake address pools
    #[serde(default)]
    pub fake_ip: FakeIpConfig,

    /// Domain rules
    #[serde(default)]
    pub domain_rules: DomainRulesConfig,

    /// CIDR rules
    #[serde(default)]
    pub ip_cidr_rules: IpCidrRulesConfig,

    /// GeoIP rules
    #[serde(default)]
    pub geo_ip: GeoIpConfig,

    /// Process rules
    #[serde(default)]
    pub app_rules: AppRulesConfig,

    /// Stack tuning
    #[serde(default)]
    pub stack: StackConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            name_server: default_name_server(),
            tun: TunConfig::default(),
            fake_ip: FakeIpConfig::default(),
            domain_rules: DomainRulesConfig::default(),
            ip_cidr_rules: IpCidrRulesConfig::default(),
            geo_ip: GeoIpConfig::default(),
            app_rules: AppRulesConfig::default(),
            stack: StackConfig::default(),
        }
    }
}

impl Config {
    /// Check every address, URL and bound before anything is acquired
    pub fn validate(&self) -> TunratsResult<()> {
        self.server.parsed_url()?;
        self.name_servers()?;
        self.tun.validate()?;
        self.fake_ip.validate()?;
        self.ip_cidr_rules.proxy_nets()?;
        self.ip_cidr_rules.direct_nets()?;
        self.geo_ip.validate()?;
        self.stack.validate()?;
        Ok(())
    }

    /// Parsed upstream DNS servers
    pub fn name_servers(&self) -> TunratsResult<Vec<NameServer>> {
        if self.name_server.is_empty() {
            return Err(TunratsError::Config("name_server must not be empty".into()));
        }
        self.name_server.iter().map(|s| s.parse()).collect()
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config.validate().with_context(|| "Invalid configuration")?;
    Ok(config)
}

/// Parse a comma separated list of process ids
///
/// Empty entries are skipped; anything else that is not a number is an error.
pub fn parse_pid_list(raw: &str) -> TunratsResult<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| TunratsError::Config(format!("invalid pid {}: {}", s, e)))
        })
        .collect()
}

/// Process ids from the environment, if the variable is set
pub fn pids_from_env() -> TunratsResult<Option<Vec<u32>>> {
    match std::env::var(PIDS_ENV) {
        Ok(raw) if !raw.trim().is_empty() => parse_pid_list(&raw).map(Some),
        _ => Ok(None),
    }
}
