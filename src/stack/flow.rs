//! Flow identity, events and the flow table

use crate::route::{Route, TargetAddr};
use crate::rules::Verdict;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Flow table key: protocol plus both endpoints as seen from the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Transport protocol
    pub protocol: Protocol,
    /// Local application endpoint
    pub src: SocketAddr,
    /// Destination the application addressed
    pub dst: SocketAddr,
}

impl FlowKey {
    /// Create a key
    pub fn new(protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Self {
        FlowKey { protocol, src, dst }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Flow lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// A flow was created
    Opened {
        /// Flow tuple
        key: FlowKey,
        /// Disposition
        verdict: Verdict,
        /// Logical destination
        target: TargetAddr,
    },
    /// A flow was torn down
    Closed {
        /// Flow tuple
        key: FlowKey,
        /// Disposition
        verdict: Verdict,
        /// Logical destination
        target: TargetAddr,
        /// Bytes received from the local application
        uploaded: u64,
        /// Bytes delivered to the local application
        downloaded: u64,
    },
}

impl FlowEvent {
    /// Tuple of the flow this event is about
    pub fn key(&self) -> &FlowKey {
        match self {
            FlowEvent::Opened { key, .. } | FlowEvent::Closed { key, .. } => key,
        }
    }
}

/// Active flow as listed for introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowInfo {
    /// Flow tuple
    pub key: FlowKey,
    /// Disposition
    pub verdict: Verdict,
    /// Logical destination
    pub target: TargetAddr,
    /// Bytes received from the local application
    pub uploaded: u64,
    /// Bytes delivered to the local application
    pub downloaded: u64,
}

/// State shared by TCP and UDP flow records
#[derive(Debug)]
pub(crate) struct FlowCore {
    pub key: FlowKey,
    pub route: Route,
    /// Child of the stack token; cancels the flow's tasks
    pub cancel: CancellationToken,
    last_seen: AtomicU64,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    closed: AtomicBool,
}

impl FlowCore {
    pub fn new(key: FlowKey, route: Route, cancel: CancellationToken, now_ms: u64) -> Self {
        FlowCore {
            key,
            route,
            cancel,
            last_seen: AtomicU64::new(now_ms),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_seen.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Milliseconds since the last packet in either direction
    pub fn idle_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }

    pub fn add_uploaded(&self, n: usize) {
        self.uploaded.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, n: usize) {
        self.downloaded.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Mark the flow closed; true only for the first caller
    pub fn finish(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn opened_event(&self) -> FlowEvent {
        FlowEvent::Opened {
            key: self.key,
            verdict: self.route.verdict,
            target: self.route.target.clone(),
        }
    }

    pub fn closed_event(&self) -> FlowEvent {
        FlowEvent::Closed {
            key: self.key,
            verdict: self.route.verdict,
            target: self.route.target.clone(),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
        }
    }

    pub fn info(&self) -> FlowInfo {
        FlowInfo {
            key: self.key,
            verdict: self.route.verdict,
            target: self.route.target.clone(),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
        }
    }
}

/// Result of a table lookup that may create a flow
#[derive(Debug)]
pub enum Lookup<F, T> {
    /// The flow already existed
    Existing(F),
    /// This call created the flow; `T` is what the creator handed back
    Created(F, T),
    /// No flow existed and the creator declined
    Refused,
}

/// Concurrent flow table
///
/// Creation is atomic with lookup: of several callers racing on the same
/// key, exactly one runs its creator.
#[derive(Debug)]
pub struct FlowTable<F> {
    flows: DashMap<FlowKey, F>,
}

impl<F: Clone> Default for FlowTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Clone> FlowTable<F> {
    /// Create an empty table
    pub fn new() -> Self {
        FlowTable {
            flows: DashMap::new(),
        }
    }

    /// Existing flow for `key`
    pub fn get(&self, key: &FlowKey) -> Option<F> {
        self.flows.get(key).map(|f| f.value().clone())
    }

    /// Return the flow for `key`, creating it with `create` if absent
    ///
    /// `create` runs with the key's shard locked and must not touch the table.
    pub fn get_or_create<T>(
        &self,
        key: FlowKey,
        create: impl FnOnce() -> Option<(F, T)>,
    ) -> Lookup<F, T> {
        match self.flows.entry(key) {
            Entry::Occupied(e) => Lookup::Existing(e.get().clone()),
            Entry::Vacant(e) => match create() {
                Some((flow, extra)) => {
                    e.insert(flow.clone());
                    Lookup::Created(flow, extra)
                }
                None => Lookup::Refused,
            },
        }
    }

    /// Remove the entry for `key` if `pred` accepts it
    pub fn remove_if(&self, key: &FlowKey, pred: impl FnOnce(&F) -> bool) -> Option<F> {
        self.flows.remove_if(key, |_, f| pred(f)).map(|(_, f)| f)
    }

    /// Snapshot of every flow
    pub fn values(&self) -> Vec<F> {
        self.flows.iter().map(|f| f.value().clone()).collect()
    }

    /// Number of flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
