//! Fake address allocator and reverse map
//!
//! Addresses are handed out in this order: recycled addresses (released or
//! swept), never-used addresses in ascending order, then the
//! least-recently-leased lease of the same family. The last step reclaims
//! an expired lease when there is one and evicts a live one otherwise, so
//! `lease` only fails for a pool without usable addresses.

use crate::config::FakeIpConfig;
use crate::error::{Result, TunratsError};
use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Address family of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4, answered to A queries
    V4,
    /// IPv6, answered to AAAA queries
    V6,
}

impl Family {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// A leased fake address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeAddress {
    /// The synthetic address
    pub address: IpAddr,
    /// Domain it stands for
    pub domain: String,
    /// When the lease lapses unless renewed
    pub deadline: Instant,
}

/// Allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeIpStats {
    /// Fresh addresses handed out
    pub allocations: u64,
    /// Leases renewed for a domain that already held one
    pub hits: u64,
    /// Live leases taken over on exhaustion
    pub evictions: u64,
    /// Expired leases taken over or swept
    pub reclaimed: u64,
    /// Leases currently held
    pub leased: usize,
}

#[derive(Debug)]
struct Lease {
    domain: String,
    deadline: Instant,
    seq: u64,
}

/// Usable range of one pool
#[derive(Debug)]
struct Block {
    family: Family,
    first: u128,
    size: u128,
    cursor: u128,
    recycled: VecDeque<IpAddr>,
}

impl Block {
    fn v4(net: Ipv4Net) -> Self {
        let host_bits = 32 - u32::from(net.prefix_len());
        let total = 1u128 << host_bits;
        let network = u128::from(u32::from(net.network()));
        // Network and broadcast are not handed out when the range has room.
        let (first, size) = if net.prefix_len() <= 30 {
            (network + 1, total - 2)
        } else {
            (network, total)
        };
        Block {
            family: Family::V4,
            first,
            size,
            cursor: 0,
            recycled: VecDeque::new(),
        }
    }

    fn v6(net: Ipv6Net) -> Self {
        let host_bits = 128 - u32::from(net.prefix_len());
        let size = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        // Offset 0 is the subnet-router anycast address.
        Block {
            family: Family::V6,
            first: u128::from(net.network()) + 1,
            size,
            cursor: 0,
            recycled: VecDeque::new(),
        }
    }

    fn address(&self, offset: u128) -> IpAddr {
        let raw = self.first + offset;
        match self.family {
            Family::V4 => IpAddr::V4(Ipv4Addr::from(raw as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(raw)),
        }
    }

    fn take_fresh(&mut self) -> Option<IpAddr> {
        if let Some(addr) = self.recycled.pop_front() {
            return Some(addr);
        }
        if self.cursor < self.size {
            let addr = self.address(self.cursor);
            self.cursor += 1;
            return Some(addr);
        }
        None
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.recycled.clear();
    }
}

#[derive(Debug)]
struct Inner {
    v4: Block,
    v6: Option<Block>,
    leases: HashMap<IpAddr, Lease>,
    by_domain: HashMap<(String, Family), IpAddr>,
    /// Lease sequence number to address, oldest first
    order: BTreeMap<u64, IpAddr>,
    seq: u64,
    stats: FakeIpStats,
}

impl Inner {
    fn block_mut(&mut self, family: Family) -> Option<&mut Block> {
        match family {
            Family::V4 => Some(&mut self.v4),
            Family::V6 => self.v6.as_mut(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn drop_lease(&mut self, addr: &IpAddr) -> Option<Lease> {
        let lease = self.leases.remove(addr)?;
        self.order.remove(&lease.seq);
        self.by_domain.remove(&(lease.domain.clone(), Family::of(addr)));
        Some(lease)
    }

    /// Oldest lease of a family, in lease order
    fn oldest(&self, family: Family) -> Option<IpAddr> {
        self.order
            .values()
            .find(|addr| Family::of(addr) == family)
            .copied()
    }
}

/// Fake address allocator with reverse lookup
///
/// All mutation goes through one exclusive lock; `resolve` and `contains`
/// only take the read side.
#[derive(Debug)]
pub struct FakeIpPool {
    v4_net: Ipv4Net,
    v6_net: Option<Ipv6Net>,
    ttl: Duration,
    inner: RwLock<Inner>,
}

impl FakeIpPool {
    /// Create an allocator over the given pools
    pub fn new(v4: Ipv4Net, v6: Option<Ipv6Net>, ttl: Duration) -> Self {
        let v4 = v4.trunc();
        let v6 = v6.map(|n| n.trunc());
        FakeIpPool {
            v4_net: v4,
            v6_net: v6,
            ttl,
            inner: RwLock::new(Inner {
                v4: Block::v4(v4),
                v6: v6.map(Block::v6),
                leases: HashMap::new(),
                by_domain: HashMap::new(),
                order: BTreeMap::new(),
                seq: 0,
                stats: FakeIpStats::default(),
            }),
        }
    }

    /// Create an allocator from configuration
    pub fn from_config(config: &FakeIpConfig) -> Result<Self> {
        Ok(Self::new(
            config.ipv4_net()?,
            config.ipv6_net()?,
            config.lease_duration(),
        ))
    }

    /// Lease lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether an IPv6 pool is configured
    pub fn has_ipv6(&self) -> bool {
        self.v6_net.is_some()
    }

    /// Configured IPv4 pool
    pub fn ipv4_net(&self) -> Ipv4Net {
        self.v4_net
    }

    /// Configured IPv6 pool
    pub fn ipv6_net(&self) -> Option<Ipv6Net> {
        self.v6_net
    }

    /// Whether `addr` falls inside a configured pool
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.v4_net.contains(v4),
            IpAddr::V6(v6) => self.v6_net.map_or(false, |n| n.contains(v6)),
        }
    }

    /// Lease an address for `domain`
    pub fn lease(&self, domain: &str, family: Family) -> Result<FakeAddress> {
        self.lease_at(domain, family, Instant::now())
    }

    /// Lease an address for `domain` as of `now`
    ///
    /// A domain that already holds an address of this family gets the same
    /// address back with a renewed deadline.
    pub fn lease_at(&self, domain: &str, family: Family, now: Instant) -> Result<FakeAddress> {
        let domain = normalize(domain);
        let deadline = now + self.ttl;
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let key = (domain.clone(), family);
        if let Some(addr) = inner.by_domain.get(&key).copied() {
            let seq = inner.next_seq();
            if let Some(lease) = inner.leases.get_mut(&addr) {
                let old = std::mem::replace(&mut lease.seq, seq);
                lease.deadline = deadline;
                inner.order.remove(&old);
                inner.order.insert(seq, addr);
                inner.stats.hits += 1;
                trace!("Renewed fake address {} for {}", addr, domain);
                return Ok(FakeAddress {
                    address: addr,
                    domain,
                    deadline,
                });
            }
        }

        let addr = match inner.block_mut(family).and_then(Block::take_fresh) {
            Some(addr) => {
                inner.stats.allocations += 1;
                addr
            }
            None => {
                let addr = inner.oldest(family).ok_or(TunratsError::PoolExhausted)?;
                if let Some(old) = inner.drop_lease(&addr) {
                    if old.deadline <= now {
                        inner.stats.reclaimed += 1;
                    } else {
                        inner.stats.evictions += 1;
                        debug!("Evicted fake address {} from {}", addr, old.domain);
                    }
                }
                addr
            }
        };

        let seq = inner.next_seq();
        inner.leases.insert(
            addr,
            Lease {
                domain: domain.clone(),
                deadline,
                seq,
            },
        );
        inner.order.insert(seq, addr);
        inner.by_domain.insert(key, addr);
        debug!("Leased fake address {} for {}", addr, domain);

        Ok(FakeAddress {
            address: addr,
            domain,
            deadline,
        })
    }

    /// Domain currently mapped to `addr`
    ///
    /// A lapsed lease keeps resolving until it is swept or reused.
    pub fn resolve(&self, addr: &IpAddr) -> Option<String> {
        self.inner.read().leases.get(addr).map(|l| l.domain.clone())
    }

    /// Current lease on `addr`
    pub fn lookup(&self, addr: &IpAddr) -> Option<FakeAddress> {
        self.inner.read().leases.get(addr).map(|l| FakeAddress {
            address: *addr,
            domain: l.domain.clone(),
            deadline: l.deadline,
        })
    }

    /// Return `addr` to the pool; false if it was not leased
    pub fn release(&self, addr: &IpAddr) -> bool {
        let mut inner = self.inner.write();
        if inner.drop_lease(addr).is_none() {
            return false;
        }
        if let Some(block) = inner.block_mut(Family::of(addr)) {
            block.recycled.push_back(*addr);
        }
        true
    }

    /// Reclaim every lease whose deadline has passed
    pub fn sweep(&self, now: Instant) -> usize {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let expired: Vec<IpAddr> = inner
            .order
            .values()
            .filter(|addr| {
                inner
                    .leases
                    .get(addr)
                    .map_or(false, |l| l.deadline <= now)
            })
            .copied()
            .collect();

        for addr in &expired {
            inner.drop_lease(addr);
            if let Some(block) = inner.block_mut(Family::of(addr)) {
                block.recycled.push_back(*addr);
            }
        }
        inner.stats.reclaimed += expired.len() as u64;
        if !expired.is_empty() {
            debug!("Swept {} expired fake addresses", expired.len());
        }
        expired.len()
    }

    /// Drop every lease and start allocating from the bottom again
    pub fn flush(&self) {
        let mut inner = self.inner.write();
        inner.leases.clear();
        inner.by_domain.clear();
        inner.order.clear();
        inner.v4.reset();
        if let Some(v6) = inner.v6.as_mut() {
            v6.reset();
        }
        debug!("Flushed fake address pool");
    }

    /// Number of leases held
    pub fn len(&self) -> usize {
        self.inner.read().leases.len()
    }

    /// Whether no lease is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot
    pub fn stats(&self) -> FakeIpStats {
        let inner = self.inner.read();
        FakeIpStats {
            leased: inner.leases.len(),
            ..inner.stats
        }
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}
