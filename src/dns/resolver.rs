//! DNS hijack resolver
//!
//! A single IN A/AAAA question for a proxied name is answered locally with
//! a fake address; a blocked name gets NXDOMAIN. Every other message goes
//! upstream and the answer is relayed as is.

use super::upstream::Upstream;
use crate::error::{Result, TunratsError};
use crate::fakeip::Family;
use crate::route::RouteContext;
use crate::rules::Verdict;
use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Resolver counters
#[derive(Debug, Default)]
pub struct ResolverStats {
    /// Queries answered with a fake address
    pub hijacked: AtomicU64,
    /// Queries answered NXDOMAIN for a blocked name
    pub blocked: AtomicU64,
    /// Queries relayed to the upstream
    pub forwarded: AtomicU64,
    /// Upstream exchanges that failed
    pub failed: AtomicU64,
}

/// Snapshot of [`ResolverStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStatsSnapshot {
    /// Queries answered with a fake address
    pub hijacked: u64,
    /// Queries answered NXDOMAIN
    pub blocked: u64,
    /// Queries relayed upstream
    pub forwarded: u64,
    /// Failed upstream exchanges
    pub failed: u64,
}

impl ResolverStats {
    /// Take a snapshot
    pub fn snapshot(&self) -> ResolverStatsSnapshot {
        ResolverStatsSnapshot {
            hijacked: self.hijacked.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Hijacking resolver
#[derive(Debug)]
pub struct Resolver {
    upstream: Arc<dyn Upstream>,
    route: RouteContext,
    hijack: bool,
    stats: ResolverStats,
}

impl Resolver {
    /// Create a resolver
    pub fn new(upstream: Arc<dyn Upstream>, route: RouteContext, hijack: bool) -> Self {
        Resolver {
            upstream,
            route,
            hijack,
            stats: ResolverStats::default(),
        }
    }

    /// Whether hijacking is on
    pub fn hijacking(&self) -> bool {
        self.hijack
    }

    /// Counters
    pub fn stats(&self) -> ResolverStatsSnapshot {
        self.stats.snapshot()
    }

    /// Answer a raw query
    pub async fn handle(&self, query: &[u8]) -> Result<Vec<u8>> {
        if self.hijack {
            if let Some(answer) = self.answer_locally(query)? {
                return Ok(answer);
            }
        }
        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
        self.upstream.query(query).await.map_err(|e| {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            e
        })
    }

    /// Local answer for a hijackable query, `None` to forward
    pub fn answer_locally(&self, query: &[u8]) -> Result<Option<Vec<u8>>> {
        let Ok(req) = Message::from_vec(query) else {
            trace!("Forwarding unparseable DNS message");
            return Ok(None);
        };
        if req.message_type() != MessageType::Query
            || req.op_code() != OpCode::Query
            || req.queries().len() != 1
        {
            return Ok(None);
        }

        let question = &req.queries()[0];
        let family = match question.query_type() {
            RecordType::A => Family::V4,
            RecordType::AAAA => Family::V6,
            _ => return Ok(None),
        };
        if question.query_class() != DNSClass::IN {
            return Ok(None);
        }

        let name = question.name().to_string();
        let domain = name.trim_end_matches('.');
        let verdict = self.route.classify_domain(domain);

        let mut rsp = Message::new();
        rsp.set_header(Header::response_from_request(req.header()));
        rsp.set_recursion_available(true);
        rsp.add_query(question.clone());

        match verdict {
            Verdict::Bypass => return Ok(None),
            Verdict::Block => {
                debug!("DNS {} is blocked", domain);
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                rsp.set_response_code(ResponseCode::NXDomain);
            }
            Verdict::Proxy => {
                self.stats.hijacked.fetch_add(1, Ordering::Relaxed);
                let pool = self.route.fake_ips();
                if family == Family::V6 && !pool.has_ipv6() {
                    trace!("No IPv6 pool, empty AAAA answer for {}", domain);
                } else {
                    match pool.lease(domain, family) {
                        Ok(lease) => {
                            let ttl = pool.ttl().as_secs().min(u32::MAX as u64) as u32;
                            let rdata = match lease.address {
                                IpAddr::V4(ip) => RData::A(A(ip)),
                                IpAddr::V6(ip) => RData::AAAA(AAAA(ip)),
                            };
                            let mut record =
                                Record::from_rdata(question.name().clone(), ttl, rdata);
                            record.set_dns_class(DNSClass::IN);
                            rsp.add_answer(record);
                            debug!("DNS {} hijacked to {}", domain, lease.address);
                        }
                        Err(e) => {
                            warn!("Fake address lease for {} failed: {}", domain, e);
                            rsp.set_response_code(ResponseCode::ServFail);
                        }
                    }
                }
            }
        }

        rsp.to_vec()
            .map(Some)
            .map_err(|e| TunratsError::Dns(format!("failed to encode answer: {}", e)))
    }
}
