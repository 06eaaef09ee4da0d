//! Process filter

use crate::config::{parse_pid_list, Config, PIDS_ENV};
use crate::error::Result;
use arc_swap::ArcSwap;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Maps a process id to its executable name
pub trait ProcessResolver: Debug + Send + Sync {
    /// Executable file name of `pid`, if the process exists
    fn process_name(&self, pid: u32) -> Option<String>;
}

/// Resolves process names through `/proc`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsResolver;

impl ProcessResolver for ProcfsResolver {
    fn process_name(&self, pid: u32) -> Option<String> {
        if let Ok(exe) = std::fs::read_link(format!("/proc/{}/exe", pid)) {
            if let Some(name) = exe.file_name() {
                return Some(name.to_string_lossy().into_owned());
            }
        }
        std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

/// Process name rules unioned with a live process id set
#[derive(Debug)]
pub struct AppFilter {
    names: RwLock<HashSet<String>>,
    pids: ArcSwap<HashSet<u32>>,
    resolver: Arc<dyn ProcessResolver>,
}

impl Default for AppFilter {
    fn default() -> Self {
        Self::new(Arc::new(ProcfsResolver))
    }
}

impl AppFilter {
    /// Create an empty filter
    pub fn new(resolver: Arc<dyn ProcessResolver>) -> Self {
        AppFilter {
            names: RwLock::new(HashSet::new()),
            pids: ArcSwap::from_pointee(HashSet::new()),
            resolver,
        }
    }

    /// Build from the process rules and the `TUNRATS_PIDS` variable
    ///
    /// Returns `None` when neither is set.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let env = std::env::var(PIDS_ENV).unwrap_or_default();
        Self::from_parts(config.app_rules.proxy.as_slice(), &env)
    }

    /// Build from process names and a raw pid list
    pub fn from_parts<S: AsRef<str>>(names: &[S], pids: &str) -> Result<Option<Self>> {
        if names.is_empty() && pids.trim().is_empty() {
            return Ok(None);
        }
        let pids = parse_pid_list(pids)?;
        let filter = AppFilter::default();
        {
            let mut w = filter.write();
            for name in names {
                w.add(name.as_ref());
            }
        }
        filter.set_pids(pids);
        Ok(Some(filter))
    }

    /// Exclusive access for bulk setup
    pub fn write(&self) -> AppFilterWriter<'_> {
        AppFilterWriter {
            guard: self.names.write(),
        }
    }

    /// Replace the live process id set
    pub fn set_pids<I: IntoIterator<Item = u32>>(&self, pids: I) {
        let set: HashSet<u32> = pids.into_iter().collect();
        debug!("Process filter now tracks {} pids", set.len());
        self.pids.store(Arc::new(set));
    }

    /// Snapshot of the live process id set
    pub fn pids(&self) -> Arc<HashSet<u32>> {
        self.pids.load_full()
    }

    /// Whether an executable name is covered
    pub fn covers_name(&self, name: &str) -> bool {
        let key = normalize(name);
        !key.is_empty() && self.names.read().contains(&key)
    }

    /// Whether a process is covered, by id or by executable name
    pub fn covers_pid(&self, pid: u32) -> bool {
        if self.pids.load().contains(&pid) {
            return true;
        }
        if self.names.read().is_empty() {
            return false;
        }
        self.resolver
            .process_name(pid)
            .map_or(false, |name| self.covers_name(&name))
    }
}

/// Write guard over the process name rules
pub struct AppFilterWriter<'a> {
    guard: RwLockWriteGuard<'a, HashSet<String>>,
}

impl AppFilterWriter<'_> {
    /// Add an executable name; paths are reduced to their file name
    pub fn add(&mut self, name: &str) -> &mut Self {
        let key = normalize(name);
        if !key.is_empty() {
            self.guard.insert(key);
        }
        self
    }
}

fn normalize(name: &str) -> String {
    name.trim()
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}
