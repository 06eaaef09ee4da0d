//! GeoIP data source

use super::prefix::PrefixTable;
use crate::config::parse_net;
use crate::error::{Result, TunratsError};
use std::fmt::Debug;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// Country lookup for an address
pub trait GeoIpSource: Debug + Send + Sync {
    /// Upper-case ISO country code of `ip`, if known
    fn country(&self, ip: IpAddr) -> Option<String>;
}

/// Country database loaded from a text file
///
/// One `<cidr> <country>` or `<cidr>,<country>` pair per line; blank lines
/// and `#` comments are ignored.
#[derive(Debug, Default)]
pub struct CidrGeoIp {
    table: PrefixTable<String>,
}

impl CidrGeoIp {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a database file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunratsError::Filter(format!("failed to read geoip file {:?}: {}", path, e))
        })?;
        let db = Self::parse(&content)
            .map_err(|e| TunratsError::Filter(format!("{:?}: {}", path, e)))?;
        info!("Loaded {} geoip ranges from {:?}", db.len(), path);
        Ok(db)
    }

    /// Parse database text
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut db = CidrGeoIp::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty());
            let (Some(cidr), Some(country), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(format!("line {}: expected `<cidr> <country>`", lineno + 1));
            };
            let net = parse_net(cidr).map_err(|e| format!("line {}: {}", lineno + 1, e))?;
            db.insert(net, country);
        }
        Ok(db)
    }

    /// Add one range
    pub fn insert(&mut self, net: ipnet::IpNet, country: &str) {
        self.table.insert(net, country.to_ascii_uppercase());
    }

    /// Number of ranges
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl GeoIpSource for CidrGeoIp {
    fn country(&self, ip: IpAddr) -> Option<String> {
        self.table.longest_match(ip).cloned()
    }
}
