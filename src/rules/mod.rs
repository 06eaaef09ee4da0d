//! Routing rules
//!
//! [`Verdict`] is the routing decision shared by every classifier in the
//! crate; [`DomainTree`] classifies domain names by longest suffix.

mod tree;

pub use tree::{DomainTree, DomainTreeBuilder, TreeHandle};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Routing decision for a flow, domain or address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Route through the tunnel handler
    Proxy,
    /// Send directly, untouched
    #[serde(alias = "direct")]
    Bypass,
    /// Drop
    #[serde(alias = "blocked", alias = "reject")]
    Block,
}

impl Verdict {
    /// Whether this verdict routes through the tunnel
    pub fn is_proxy(self) -> bool {
        self == Verdict::Proxy
    }
}

impl Default for Verdict {
    fn default() -> Self {
        Verdict::Bypass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Proxy => write!(f, "proxy"),
            Verdict::Bypass => write!(f, "bypass"),
            Verdict::Block => write!(f, "block"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "proxy" => Ok(Verdict::Proxy),
            "bypass" | "direct" => Ok(Verdict::Bypass),
            "block" | "blocked" | "reject" => Ok(Verdict::Block),
            other => Err(format!("unknown verdict: {}", other)),
        }
    }
}
