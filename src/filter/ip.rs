//! IP filter
//!
//! Classification order: the most specific explicit CIDR rule, then the
//! GeoIP country lists (proxy before bypass), then the final verdict.

use super::geoip::{CidrGeoIp, GeoIpSource};
use super::prefix::PrefixTable;
use crate::config::{parse_net, Config};
use crate::error::Result;
use crate::rules::Verdict;
use ipnet::IpNet;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Ranges never intercepted: loopback, private, link-local, CGNAT,
/// multicast, broadcast, unique-local and unspecified
const PRIVATE_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

#[derive(Debug)]
struct GeoRules {
    source: Arc<dyn GeoIpSource>,
    proxy: HashSet<String>,
    bypass: HashSet<String>,
}

#[derive(Debug)]
struct IpRules {
    cidrs: PrefixTable<Verdict>,
    geo: Option<GeoRules>,
    final_verdict: Verdict,
}

/// CIDR and GeoIP based address classifier
#[derive(Debug)]
pub struct IpFilter {
    inner: RwLock<IpRules>,
}

impl Default for IpFilter {
    fn default() -> Self {
        Self::new(Verdict::Bypass)
    }
}

impl IpFilter {
    /// Create a filter with no rules
    pub fn new(final_verdict: Verdict) -> Self {
        IpFilter {
            inner: RwLock::new(IpRules {
                cidrs: PrefixTable::new(),
                geo: None,
                final_verdict,
            }),
        }
    }

    /// Build the filter described by the CIDR and GeoIP sections
    pub fn from_config(config: &Config) -> Result<Self> {
        let filter = IpFilter::new(config.geo_ip.final_verdict);
        filter.apply_config(config)?;
        Ok(filter)
    }

    /// Load the CIDR and GeoIP sections into this filter
    ///
    /// Everything is parsed before the write lock is taken, so a bad entry
    /// leaves the filter untouched.
    pub fn apply_config(&self, config: &Config) -> Result<()> {
        let proxy = config.ip_cidr_rules.proxy_nets()?;
        let direct = config.ip_cidr_rules.direct_nets()?;
        let geo = match config.geo_ip.file.as_deref() {
            Some(file) if config.geo_ip.enabled() => Some(CidrGeoIp::load(file)?),
            _ => None,
        };

        let mut w = self.write();
        w.set_final(config.geo_ip.final_verdict);
        for net in proxy {
            w.add(net, Verdict::Proxy);
        }
        for net in direct {
            w.add(net, Verdict::Bypass);
        }
        if let Some(db) = geo {
            w.set_geoip(
                Arc::new(db),
                config.geo_ip.proxy.as_slice(),
                config.geo_ip.bypass.as_slice(),
            );
        }
        Ok(())
    }

    /// Exclusive access for bulk setup
    pub fn write(&self) -> IpFilterWriter<'_> {
        IpFilterWriter {
            guard: self.inner.write(),
        }
    }

    /// Classify an address
    pub fn classify(&self, ip: IpAddr) -> Verdict {
        let rules = self.inner.read();
        if let Some(v) = rules.cidrs.longest_match(ip) {
            return *v;
        }
        if let Some(geo) = &rules.geo {
            if let Some(country) = geo.source.country(ip) {
                if geo.proxy.contains(&country) {
                    return Verdict::Proxy;
                }
                if geo.bypass.contains(&country) {
                    return Verdict::Bypass;
                }
            }
        }
        rules.final_verdict
    }

    /// Whether traffic to `ip` is intercepted and proxied
    pub fn covers(&self, ip: IpAddr) -> bool {
        self.classify(ip) == Verdict::Proxy
    }

    /// Add the never-intercepted ranges as bypass rules
    pub fn ignore_private(&self) {
        self.write().ignore_private();
    }

    /// Number of explicit CIDR rules
    pub fn rule_count(&self) -> usize {
        self.inner.read().cidrs.len()
    }
}

/// Write guard over an [`IpFilter`]; queries block while it is held
pub struct IpFilterWriter<'a> {
    guard: RwLockWriteGuard<'a, IpRules>,
}

impl IpFilterWriter<'_> {
    /// Add or replace a CIDR rule
    pub fn add(&mut self, net: IpNet, verdict: Verdict) -> &mut Self {
        self.guard.cidrs.insert(net, verdict);
        self
    }

    /// Parse and add a CIDR rule; a bare address is a host rule
    pub fn add_str(&mut self, cidr: &str, verdict: Verdict) -> Result<&mut Self> {
        let net = parse_net(cidr)?;
        Ok(self.add(net, verdict))
    }

    /// Attach a GeoIP source with its country lists
    pub fn set_geoip<S: AsRef<str>>(
        &mut self,
        source: Arc<dyn GeoIpSource>,
        proxy: &[S],
        bypass: &[S],
    ) -> &mut Self {
        let upper = |list: &[S]| -> HashSet<String> {
            list.iter()
                .map(|c| c.as_ref().trim().to_ascii_uppercase())
                .collect()
        };
        self.guard.geo = Some(GeoRules {
            source,
            proxy: upper(proxy),
            bypass: upper(bypass),
        });
        self
    }

    /// Set the verdict for unmatched addresses
    pub fn set_final(&mut self, verdict: Verdict) -> &mut Self {
        self.guard.final_verdict = verdict;
        self
    }

    /// Add the never-intercepted ranges as bypass rules
    ///
    /// A range already present as an explicit rule keeps its verdict.
    pub fn ignore_private(&mut self) -> &mut Self {
        let mut added = 0;
        for range in PRIVATE_RANGES {
            if let Ok(net) = range.parse::<IpNet>() {
                if self.guard.cidrs.get(&net).is_none() {
                    self.guard.cidrs.insert(net, Verdict::Bypass);
                    added += 1;
                }
            }
        }
        debug!("Excluded {} private ranges from interception", added);
        self
    }
}
