//! Stack counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Statistics for the flow stack
#[derive(Debug, Default)]
pub struct StackStats {
    /// Packets read from the device
    pub packets_in: AtomicU64,
    /// Packets written to the device
    pub packets_out: AtomicU64,
    /// Packets dropped as malformed
    pub malformed: AtomicU64,
    /// Packets dropped for an unsupported protocol or fragmentation
    pub unsupported: AtomicU64,
    /// New flows refused by a block verdict
    pub blocked: AtomicU64,
    /// Packets dropped because no flow matched
    pub orphaned: AtomicU64,
    /// DNS queries handed to the resolver
    pub dns_queries: AtomicU64,
    /// Segments or datagrams dropped on a full flow queue
    pub backpressure_drops: AtomicU64,
    /// TCP flows torn down for exceeding the reassembly window
    pub window_overflows: AtomicU64,
    /// Flows refused because the table was full
    pub table_full: AtomicU64,
    /// Total flows created
    pub flows_opened: AtomicU64,
    /// Total flows torn down
    pub flows_closed: AtomicU64,
    /// Flows currently in the table
    pub active_flows: AtomicUsize,
}

impl StackStats {
    /// Create new stack stats
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Claim a table slot for a new flow unless `max` flows are active
    pub fn try_open(&self, max: usize) -> bool {
        let claimed = self
            .active_flows
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();
        if claimed {
            self.flows_opened.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }

    /// Record a flow teardown
    pub fn record_closed(&self) {
        self.flows_closed.fetch_add(1, Ordering::Relaxed);
        self.active_flows.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> StackStatsSnapshot {
        StackStatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            dns_queries: self.dns_queries.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            window_overflows: self.window_overflows.load(Ordering::Relaxed),
            table_full: self.table_full.load(Ordering::Relaxed),
            flows_opened: self.flows_opened.load(Ordering::Relaxed),
            flows_closed: self.flows_closed.load(Ordering::Relaxed),
            active_flows: self.active_flows.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of stack statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StackStatsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub malformed: u64,
    pub unsupported: u64,
    pub blocked: u64,
    pub orphaned: u64,
    pub dns_queries: u64,
    pub backpressure_drops: u64,
    pub window_overflows: u64,
    pub table_full: u64,
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub active_flows: usize,
}
