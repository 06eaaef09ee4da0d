//! Domain rule tree
//!
//! A trie over reversed domain labels. `mail.example.com` is stored as
//! `com -> example -> mail`, and a lookup walks from the root keeping the
//! most specific rule seen on the way down.

use super::Verdict;
use crate::config::DomainRulesConfig;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    /// Rule for this domain, inherited by unset descendants
    rule: Option<Verdict>,
    /// Rule for strict subdomains only (`*.example.com`)
    wildcard: Option<Verdict>,
}

/// Immutable longest-suffix domain classifier
#[derive(Debug)]
pub struct DomainTree {
    root: Node,
    default: Verdict,
    rule_count: usize,
}

impl DomainTree {
    /// Create a builder with the given fallback verdict
    pub fn builder(default: Verdict) -> DomainTreeBuilder {
        DomainTreeBuilder::new(default)
    }

    /// A tree with no rules, classifying everything as `default`
    pub fn empty(default: Verdict) -> Self {
        DomainTreeBuilder::new(default).build()
    }

    /// Build the tree described by the domain rule lists
    ///
    /// Lists are applied proxy, direct, blocked; a name listed twice keeps
    /// the later verdict.
    pub fn from_config(rules: &DomainRulesConfig) -> Self {
        DomainTreeBuilder::new(rules.final_verdict)
            .add_all(&rules.proxy, Verdict::Proxy)
            .add_all(&rules.direct, Verdict::Bypass)
            .add_all(&rules.blocked, Verdict::Block)
            .build()
    }

    /// Classify a domain name
    pub fn classify(&self, domain: &str) -> Verdict {
        self.lookup(domain).unwrap_or(self.default)
    }

    /// Most specific configured rule for a domain, without the fallback
    pub fn lookup(&self, domain: &str) -> Option<Verdict> {
        let domain = normalize(domain);
        let mut verdict = None;
        let mut node = &self.root;

        for label in domain.rsplit('.').filter(|l| !l.is_empty()) {
            // Anything below `node` is a strict subdomain of it.
            if let Some(w) = node.wildcard {
                verdict = Some(w);
            }
            match node.children.get(label) {
                Some(child) => {
                    node = child;
                    if let Some(r) = child.rule {
                        verdict = Some(r);
                    }
                }
                None => break,
            }
        }

        verdict
    }

    /// Fallback verdict
    pub fn default_verdict(&self) -> Verdict {
        self.default
    }

    /// Number of distinct rules in the tree
    pub fn rule_count(&self) -> usize {
        self.rule_count
    }
}

/// Builder for [`DomainTree`]
#[derive(Debug)]
pub struct DomainTreeBuilder {
    root: Node,
    default: Verdict,
}

impl DomainTreeBuilder {
    /// Create an empty builder
    pub fn new(default: Verdict) -> Self {
        DomainTreeBuilder {
            root: Node::default(),
            default,
        }
    }

    /// Add one rule
    ///
    /// `example.com` applies to the domain and its subdomains;
    /// `*.example.com` and `.example.com` apply to subdomains only.
    /// A repeated identical key keeps the last verdict.
    pub fn add(mut self, pattern: &str, verdict: Verdict) -> Self {
        self.insert(pattern, verdict);
        self
    }

    /// Add every pattern in `patterns` with the same verdict
    pub fn add_all<I, S>(mut self, patterns: I, verdict: Verdict) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.insert(pattern.as_ref(), verdict);
        }
        self
    }

    fn insert(&mut self, pattern: &str, verdict: Verdict) {
        let pattern = normalize(pattern);
        let (wildcard, name) = match pattern.strip_prefix("*.") {
            Some(rest) => (true, rest),
            None => match pattern.strip_prefix('.') {
                Some(rest) => (true, rest),
                None => (false, pattern.as_str()),
            },
        };
        if name.is_empty() {
            return;
        }

        let mut node = &mut self.root;
        for label in name.rsplit('.').filter(|l| !l.is_empty()) {
            node = node.children.entry(label.to_string()).or_default();
        }
        if wildcard {
            node.wildcard = Some(verdict);
        } else {
            node.rule = Some(verdict);
        }
    }

    /// Freeze the tree
    pub fn build(self) -> DomainTree {
        let rule_count = count_rules(&self.root);
        DomainTree {
            root: self.root,
            default: self.default,
            rule_count,
        }
    }
}

fn count_rules(node: &Node) -> usize {
    let own = node.rule.is_some() as usize + node.wildcard.is_some() as usize;
    own + node.children.values().map(count_rules).sum::<usize>()
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Atomically replaceable reference to the active tree
///
/// Readers take a lock-free snapshot; `reload` publishes a fully built
/// tree in one store.
#[derive(Debug)]
pub struct TreeHandle {
    current: ArcSwap<DomainTree>,
}

impl TreeHandle {
    /// Wrap a tree
    pub fn new(tree: DomainTree) -> Self {
        TreeHandle {
            current: ArcSwap::from_pointee(tree),
        }
    }

    /// Snapshot of the active tree
    pub fn load(&self) -> Arc<DomainTree> {
        self.current.load_full()
    }

    /// Classify against the active tree
    pub fn classify(&self, domain: &str) -> Verdict {
        self.current.load().classify(domain)
    }

    /// Replace the active tree
    pub fn reload(&self, tree: DomainTree) {
        self.current.store(Arc::new(tree));
    }
}
