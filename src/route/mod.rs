//! Routing context
//!
//! [`RouteContext`] bundles the fake address pool, the domain rule tree
//! and the filters. It is built once per pipeline and shared by the
//! resolver, the stack and any front-end that needs the same decisions.

mod target;

pub use target::TargetAddr;

use crate::fakeip::FakeIpPool;
use crate::filter::{AppFilter, IpFilter};
use crate::rules::{DomainTree, TreeHandle, Verdict};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::trace;

/// Decision for a new flow, fixed at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Disposition
    pub verdict: Verdict,
    /// Where the handler connects
    pub target: TargetAddr,
}

/// Shared routing state
#[derive(Debug, Clone)]
pub struct RouteContext {
    fake_ips: Arc<FakeIpPool>,
    tree: Arc<TreeHandle>,
    ip_filter: Arc<IpFilter>,
    app_filter: Option<Arc<AppFilter>>,
}

impl RouteContext {
    /// Bundle the routing structures
    pub fn new(
        fake_ips: Arc<FakeIpPool>,
        tree: Arc<TreeHandle>,
        ip_filter: Arc<IpFilter>,
        app_filter: Option<Arc<AppFilter>>,
    ) -> Self {
        RouteContext {
            fake_ips,
            tree,
            ip_filter,
            app_filter,
        }
    }

    /// Fake address pool
    pub fn fake_ips(&self) -> &Arc<FakeIpPool> {
        &self.fake_ips
    }

    /// Domain rule tree handle
    pub fn tree(&self) -> &Arc<TreeHandle> {
        &self.tree
    }

    /// IP filter
    pub fn ip_filter(&self) -> &Arc<IpFilter> {
        &self.ip_filter
    }

    /// Process filter, if configured
    pub fn app_filter(&self) -> Option<&Arc<AppFilter>> {
        self.app_filter.as_ref()
    }

    /// Swap in a new domain rule tree
    pub fn reload_rules(&self, tree: DomainTree) {
        self.tree.reload(tree);
    }

    /// Classify a domain name
    pub fn classify_domain(&self, domain: &str) -> Verdict {
        self.tree.classify(domain)
    }

    /// Classify an address; fake addresses classify by their domain
    pub fn classify_ip(&self, ip: IpAddr) -> Verdict {
        self.route(SocketAddr::new(ip, 0)).verdict
    }

    /// Classify a front-end request target
    pub fn classify_target(&self, target: &TargetAddr) -> Verdict {
        match target {
            TargetAddr::Domain(domain, _) => self.classify_domain(domain),
            TargetAddr::Ip(addr) => self.route(*addr).verdict,
        }
    }

    /// Route a new flow toward `dst`
    ///
    /// A fake destination is replaced by the domain it was leased for; a
    /// fake destination with no lease is blocked since its domain is lost.
    pub fn route(&self, dst: SocketAddr) -> Route {
        let ip = dst.ip();
        if self.fake_ips.contains(&ip) {
            return match self.fake_ips.resolve(&ip) {
                Some(domain) => {
                    let verdict = self.classify_domain(&domain);
                    trace!("Fake address {} maps to {} ({})", ip, domain, verdict);
                    Route {
                        verdict,
                        target: TargetAddr::Domain(domain, dst.port()),
                    }
                }
                None => {
                    trace!("Fake address {} has no lease", ip);
                    Route {
                        verdict: Verdict::Block,
                        target: TargetAddr::Ip(dst),
                    }
                }
            };
        }

        Route {
            verdict: self.ip_filter.classify(ip),
            target: TargetAddr::Ip(dst),
        }
    }
}
