//! # Tunrats - Transparent Tunneling Client
//!
//! Tunrats captures IP traffic from a virtual interface, rebuilds TCP and
//! UDP flows in userspace, and sends each flow either through a tunnel
//! upstream or straight out. DNS queries are intercepted so that proxied
//! domains resolve to synthetic ("fake") addresses that the stack maps back
//! to the domain when a flow to them opens.
//!
//! ## Features
//!
//! - **Userspace Flow Stack**: TCP handshake, reassembly and teardown without a kernel socket
//! - **FakeIP DNS Hijacking**: Proxied names answer from a reserved pool with a reverse map
//! - **Rule Routing**: Domain suffix rules, CIDR rules, GeoIP countries and process names
//! - **Pluggable Handlers**: SOCKS5 and HTTP CONNECT upstreams, direct egress
//! - **Ordered Teardown**: Every setup resource is released in reverse order
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tunrats::config::load_config;
//! use tunrats::device::TunDevice;
//! use tunrats::handler::create_handler;
//! use tunrats::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let device = Arc::new(TunDevice::create(&config.tun.name, config.tun.mtu as usize)?);
//!     let handler = create_handler(&config.server)?;
//!
//!     let pipeline = Pipeline::start(config, device, handler).await?;
//!     pipeline.stopped().await;
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Device -> Stack -> [DNS? -> Resolver]
//!                 -> RouteContext (fake IP, rules, filters) -> Dispatcher -> Handler
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod app;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod fakeip;
pub mod filter;
pub mod handler;
pub mod helper;
pub mod route;
pub mod rules;
pub mod stack;

// Re-export commonly used items
pub use app::{Closers, Pipeline, PipelineStats};
pub use config::{load_config, Config};
pub use error::{PacketError, SetupStage, TunratsError};
pub use route::{Route, RouteContext, TargetAddr};
pub use rules::Verdict;

/// Version of the Tunrats library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
