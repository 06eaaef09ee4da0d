//! Packet source and sink
//!
//! The stack is written once against [`Device`]. [`ChannelDevice`] moves
//! packets over in-memory channels (diversion bridges, tests);
//! `TunDevice` drives a kernel TUN interface.

mod channel;
#[cfg(feature = "tun-device")]
mod tun;

pub use channel::{ChannelDevice, ChannelPeer};
#[cfg(feature = "tun-device")]
pub use self::tun::TunDevice;

use crate::error::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt::Debug;
use std::io;

/// Raw IP packet source/sink with interface configuration
#[async_trait]
pub trait Device: Debug + Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    /// Largest packet the device carries
    fn mtu(&self) -> usize;

    /// Read one packet into `buf`; `Ok(0)` means the source is gone
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> io::Result<()>;

    /// Assign an address to the interface
    async fn set_interface_address(&self, addr: IpNet) -> Result<()>;

    /// Bring the interface up
    async fn activate(&self) -> Result<()>;

    /// Route the given networks through the interface
    async fn add_routes(&self, routes: &[IpNet]) -> Result<()>;

    /// Stop delivering packets; pending and later `recv` calls return `Ok(0)`
    async fn close(&self) -> Result<()>;
}
