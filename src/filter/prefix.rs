//! Longest-prefix match table
//!
//! Networks are bucketed by prefix length; a lookup truncates the address
//! to each populated length, longest first, and probes the bucket.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// Map from networks to values with longest-prefix lookup
#[derive(Debug, Clone)]
pub struct PrefixTable<T> {
    v4: BTreeMap<u8, HashMap<Ipv4Net, T>>,
    v6: BTreeMap<u8, HashMap<Ipv6Net, T>>,
    len: usize,
}

impl<T> Default for PrefixTable<T> {
    fn default() -> Self {
        PrefixTable {
            v4: BTreeMap::new(),
            v6: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<T> PrefixTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `net`
    pub fn insert(&mut self, net: IpNet, value: T) {
        let replaced = match net.trunc() {
            IpNet::V4(n) => self
                .v4
                .entry(n.prefix_len())
                .or_default()
                .insert(n, value)
                .is_some(),
            IpNet::V6(n) => self
                .v6
                .entry(n.prefix_len())
                .or_default()
                .insert(n, value)
                .is_some(),
        };
        if !replaced {
            self.len += 1;
        }
    }

    /// Value stored for exactly `net`
    pub fn get(&self, net: &IpNet) -> Option<&T> {
        match net.trunc() {
            IpNet::V4(n) => self.v4.get(&n.prefix_len()).and_then(|b| b.get(&n)),
            IpNet::V6(n) => self.v6.get(&n.prefix_len()).and_then(|b| b.get(&n)),
        }
    }

    /// Value of the most specific network containing `ip`
    pub fn longest_match(&self, ip: IpAddr) -> Option<&T> {
        match ip {
            IpAddr::V4(ip) => self.v4.iter().rev().find_map(|(len, bucket)| {
                Ipv4Net::new(ip, *len)
                    .ok()
                    .and_then(|n| bucket.get(&n.trunc()))
            }),
            IpAddr::V6(ip) => self.v6.iter().rev().find_map(|(len, bucket)| {
                Ipv6Net::new(ip, *len)
                    .ok()
                    .and_then(|n| bucket.get(&n.trunc()))
            }),
        }
    }

    /// Number of networks
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut table = PrefixTable::new();
        table.insert(net("10.0.0.0/8"), "wide");
        table.insert(net("10.1.0.0/16"), "narrow");
        table.insert(net("0.0.0.0/0"), "any");

        assert_eq!(table.longest_match(ip("10.1.2.3")), Some(&"narrow"));
        assert_eq!(table.longest_match(ip("10.2.0.1")), Some(&"wide"));
        assert_eq!(table.longest_match(ip("8.8.8.8")), Some(&"any"));
        assert_eq!(table.longest_match(ip("::1")), None);
    }

    #[test]
    fn test_insert_truncates_and_replaces() {
        let mut table = PrefixTable::new();
        table.insert(net("192.168.1.77/24"), 1);
        table.insert(net("192.168.1.0/24"), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.longest_match(ip("192.168.1.200")), Some(&2));
    }

    #[test]
    fn test_get_is_exact() {
        let mut table = PrefixTable::new();
        table.insert(net("10.0.0.0/8"), 'a');
        assert_eq!(table.get(&net("10.0.0.0/8")), Some(&'a'));
        assert_eq!(table.get(&net("10.9.9.9/8")), Some(&'a'));
        assert_eq!(table.get(&net("10.0.0.0/16")), None);
        assert_eq!(table.get(&net("::/0")), None);
    }

    #[test]
    fn test_ipv6_match() {
        let mut table = PrefixTable::new();
        table.insert(net("2001:db8::/32"), 'a');
        table.insert(net("2001:db8:1::/48"), 'b');
        assert_eq!(table.longest_match(ip("2001:db8:1::5")), Some(&'b'));
        assert_eq!(table.longest_match(ip("2001:db8:2::5")), Some(&'a'));
        assert_eq!(table.longest_match(ip("2001:db9::")), None);
        assert!(!table.is_empty());
    }
}
