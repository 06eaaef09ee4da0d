//! Pipeline assembly
//!
//! [`Pipeline::start`] builds every component in a fixed order. Each acquired
//! resource registers a closer; a failure at any stage runs the closers
//! registered so far in reverse and reports the failing stage.

use crate::config::{Config, DomainRulesConfig};
use crate::device::Device;
use crate::dispatch::Dispatcher;
use crate::dns::{Resolver, ResolverStatsSnapshot, UpstreamSet};
use crate::error::{Result, SetupStage, TunratsError};
use crate::fakeip::{FakeIpPool, FakeIpStats};
use crate::filter::{AppFilter, CaptureGate, IpFilter};
use crate::handler::{
    ConnectionInfo, ConnectionRegistry, DirectHandler, Handler, Recorder, SocketOpts,
};
use crate::helper::duration_from_secs;
use crate::helper::DEFAULT_DNS_TIMEOUT_SECS;
use crate::route::{RouteContext, TargetAddr};
use crate::rules::{DomainTree, TreeHandle, Verdict};
use crate::stack::{FlowEvent, FlowInfo, Stack, StackStatsSnapshot};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Ordered list of release actions
///
/// Closers run in reverse registration order; a failing closer is logged
/// and the rest still run.
#[derive(Default)]
pub struct Closers {
    entries: Vec<(String, CloseFn)>,
}

impl Closers {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closer
    pub fn push<F, Fut>(&mut self, name: impl Into<String>, close: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let close: CloseFn = Box::new(move || Box::pin(close()));
        self.entries.push((name.into(), close));
    }

    /// Number of registered closers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every closer, last registered first
    pub async fn close_all(&mut self) {
        while let Some((name, close)) = self.entries.pop() {
            match close().await {
                Ok(()) => debug!("Closed {}", name),
                Err(e) => warn!("Failed to close {}: {:#}", name, e),
            }
        }
    }
}

impl fmt::Debug for Closers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.entries.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("Closers").field("entries", &names).finish()
    }
}

/// Counters from every component
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// Flow stack counters
    pub stack: StackStatsSnapshot,
    /// Resolver counters
    pub resolver: ResolverStatsSnapshot,
    /// Fake address pool counters
    pub fake_ip: FakeIpStats,
}

/// A running capture pipeline
pub struct Pipeline {
    config: Config,
    route: RouteContext,
    resolver: Arc<Resolver>,
    registry: Arc<ConnectionRegistry>,
    stack: Arc<Stack>,
    device: Arc<dyn Device>,
    cancel: CancellationToken,
    closers: Mutex<Closers>,
}

/// Run one setup stage; on failure close everything acquired so far
async fn stage<T, F>(closers: &mut Closers, stage: SetupStage, step: F) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    debug!("Setting up {}", stage);
    match step.await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("{} setup failed, releasing {} resources", stage, closers.len());
            closers.close_all().await;
            Err(TunratsError::setup(stage, e))
        }
    }
}

impl Pipeline {
    /// Build and start the pipeline on `device`, tunnelling through `proxy`
    ///
    /// Setup order: resolver, handler, device, rules, filters, stack,
    /// routes. The device is not read until the stack stage.
    pub async fn start(
        config: Config,
        device: Arc<dyn Device>,
        proxy: Arc<dyn Handler>,
    ) -> Result<Self> {
        config.validate()?;
        let app_filter = AppFilter::from_config(&config)?.map(Arc::new);
        let fake_ips = Arc::new(FakeIpPool::from_config(&config.fake_ip)?);
        let tree = Arc::new(TreeHandle::new(DomainTree::empty(
            config.domain_rules.final_verdict,
        )));
        let ip_filter = Arc::new(IpFilter::new(config.geo_ip.final_verdict));
        let route = RouteContext::new(fake_ips.clone(), tree.clone(), ip_filter.clone(), app_filter);
        let cancel = CancellationToken::new();
        let mut closers = Closers::new();
        // Owned from here on, so released on any stage failure.
        {
            let proxy = proxy.clone();
            closers.push("handler", move || async move {
                proxy.close().await?;
                Ok(())
            });
        }

        let resolver = stage(&mut closers, SetupStage::Resolver, async {
            let servers = config.name_servers()?;
            let upstream =
                UpstreamSet::from_servers(&servers, duration_from_secs(DEFAULT_DNS_TIMEOUT_SECS))?;
            Ok(Arc::new(Resolver::new(
                Arc::new(upstream),
                route.clone(),
                config.domain_rules.hijack(),
            )))
        })
        .await?;
        {
            let fake_ips = fake_ips.clone();
            closers.push("resolver", move || async move {
                fake_ips.flush();
                Ok(())
            });
        }

        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = stage(&mut closers, SetupStage::Handler, async {
            let direct: Arc<dyn Handler> = Arc::new(DirectHandler::new(
                SocketOpts::from_server_config(&config.server),
                config.server.connect_timeout(),
            ));
            info!("Tunnel handler: {}", proxy.name());
            Ok(Arc::new(Dispatcher::new(
                Arc::new(Recorder::new(proxy.clone(), registry.clone())),
                Arc::new(Recorder::new(direct, registry.clone())),
            )))
        })
        .await?;

        {
            let device = device.clone();
            closers.push("device", move || async move {
                device.close().await?;
                Ok(())
            });
        }

        stage(&mut closers, SetupStage::Device, async {
            for addr in config.tun.addresses()? {
                device.set_interface_address(addr).await?;
            }
            device.activate().await?;
            Ok(())
        })
        .await?;

        stage(&mut closers, SetupStage::Rules, async {
            let built = DomainTree::from_config(&config.domain_rules);
            info!("Loaded {} domain rules", built.rule_count());
            tree.reload(built);
            Ok(())
        })
        .await?;

        stage(&mut closers, SetupStage::Filters, async {
            ip_filter.apply_config(&config)?;
            ip_filter.ignore_private();
            info!("Loaded {} address rules", ip_filter.rule_count());
            Ok(())
        })
        .await?;

        let stack = stage(&mut closers, SetupStage::Stack, async {
            config.stack.validate()?;
            Ok(Arc::new(Stack::start(
                device.clone(),
                config.stack.clone(),
                route.clone(),
                resolver.clone(),
                dispatcher.clone(),
                cancel.child_token(),
            )))
        })
        .await?;
        {
            let stack = stack.clone();
            closers.push("stack", move || async move {
                stack.close().await;
                Ok(())
            });
        }

        stage(&mut closers, SetupStage::Routes, async {
            let mut routes = config.ip_cidr_rules.proxy_nets()?;
            routes.extend(config.fake_ip.pools()?);
            device.add_routes(&routes).await?;
            info!("Installed {} routes on {}", routes.len(), device.name());
            Ok(())
        })
        .await?;

        info!("Pipeline started on {}", device.name());
        Ok(Pipeline {
            config,
            route,
            resolver,
            registry,
            stack,
            device,
            cancel,
            closers: Mutex::new(closers),
        })
    }

    /// Register a closer that runs on shutdown before everything set up here
    pub fn attach_closer<F, Fut>(&self, name: impl Into<String>, close: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.lock().push(name, close);
    }

    /// Stop the pipeline and release everything in reverse order
    pub async fn shutdown(&self) {
        info!("Shutting down pipeline");
        self.cancel.cancel();
        let mut closers = std::mem::take(&mut *self.closers.lock());
        closers.close_all().await;
        info!("Pipeline stopped");
    }

    /// Wait until the pipeline stops, either by shutdown or device failure
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.stack.stopped() => {}
        }
    }

    /// Routing decision for a front-end request
    pub fn classify_target(&self, target: &TargetAddr) -> Verdict {
        self.route.classify_target(target)
    }

    /// Routing context shared by every component
    pub fn route(&self) -> &RouteContext {
        &self.route
    }

    /// Capture decision for diverted packet sources
    pub fn capture_gate(&self) -> CaptureGate {
        CaptureGate::new(
            self.route.ip_filter().clone(),
            self.route.app_filter().cloned(),
            self.resolver.hijacking(),
        )
    }

    /// Outbound connections currently open
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.list()
    }

    /// Flows currently tracked by the stack
    pub fn flows(&self) -> Vec<FlowInfo> {
        self.stack.flows()
    }

    /// Subscribe to flow open/close events
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.stack.subscribe()
    }

    /// Counters from every component
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            stack: self.stack.stats(),
            resolver: self.resolver.stats(),
            fake_ip: self.route.fake_ips().stats(),
        }
    }

    /// Replace the domain rules without restarting
    pub fn reload_rules(&self, rules: &DomainRulesConfig) {
        let tree = DomainTree::from_config(rules);
        info!("Reloaded {} domain rules", tree.rule_count());
        self.route.reload_rules(tree);
    }

    /// Configuration the pipeline was started with
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("device", &self.device.name())
            .field("stack", &self.stack)
            .field("closers", &*self.closers.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_closers_run_in_reverse() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut closers = Closers::new();
        for name in ["a", "b", "c"] {
            let order = order.clone();
            closers.push(name, move || async move {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        assert_eq!(closers.len(), 3);
        closers.close_all().await;
        assert!(closers.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_failing_closer_does_not_stop_the_rest() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut closers = Closers::new();
        {
            let order = order.clone();
            closers.push("first", move || async move {
                order.lock().unwrap().push("first");
                Ok(())
            });
        }
        closers.push("broken", || async { Err(anyhow::anyhow!("boom")) });
        closers.close_all().await;
        assert_eq!(*order.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_stage_failure_names_stage() {
        let closed = Arc::new(StdMutex::new(false));
        let mut closers = Closers::new();
        {
            let closed = closed.clone();
            closers.push("device", move || async move {
                *closed.lock().unwrap() = true;
                Ok(())
            });
        }
        let err = stage::<(), _>(&mut closers, SetupStage::Filters, async {
            Err(anyhow::anyhow!("missing geoip data"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.stage(), Some(SetupStage::Filters));
        assert_eq!(
            err.to_string(),
            "filters setup failed: missing geoip data"
        );
        assert!(*closed.lock().unwrap());
    }
}
