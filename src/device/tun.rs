//! Kernel TUN interface
//!
//! Packets move through the `tun` crate's async device. Addresses and routes
//! are configured with the `ip` command.

use super::Device;
use crate::error::{Result, TunratsError};
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// TUN device driven through the `tun` crate
pub struct TunDevice {
    name: String,
    mtu: usize,
    reader: Mutex<ReadHalf<::tun::AsyncDevice>>,
    writer: Mutex<WriteHalf<::tun::AsyncDevice>>,
    closed: CancellationToken,
}

impl TunDevice {
    /// Create the interface; it stays down until [`Device::activate`]
    pub fn create(name: &str, mtu: usize) -> Result<Self> {
        let mtu16 = u16::try_from(mtu)
            .map_err(|_| TunratsError::Device(format!("mtu {} out of range", mtu)))?;

        let mut config = ::tun::Configuration::default();
        config.tun_name(name).mtu(mtu16);

        let device = ::tun::create_as_async(&config)
            .map_err(|e| TunratsError::Device(format!("failed to create {}: {}", name, e)))?;
        let (reader, writer) = tokio::io::split(device);

        info!("Created TUN device {} (mtu {})", name, mtu);
        Ok(TunDevice {
            name: name.to_string(),
            mtu,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        })
    }

    async fn ip(&self, args: &[&str]) -> Result<()> {
        debug!("Running ip {}", args.join(" "));
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| TunratsError::Device(format!("failed to run ip: {}", e)))?;
        if !output.status.success() {
            return Err(TunratsError::Device(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Device for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(0),
            n = reader.read(buf) => n,
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        let mut writer = self.writer.lock().await;
        let n = writer.write(packet).await?;
        if n != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short packet write: {} of {}", n, packet.len()),
            ));
        }
        Ok(())
    }

    async fn set_interface_address(&self, addr: IpNet) -> Result<()> {
        let addr = addr.to_string();
        self.ip(&["addr", "add", &addr, "dev", &self.name]).await
    }

    async fn activate(&self) -> Result<()> {
        self.ip(&["link", "set", "dev", &self.name, "up"]).await?;
        info!("TUN device {} is up", self.name);
        Ok(())
    }

    async fn add_routes(&self, routes: &[IpNet]) -> Result<()> {
        for route in routes {
            let net = route.to_string();
            self.ip(&["route", "replace", &net, "dev", &self.name]).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing TUN device {}", self.name);
        self.closed.cancel();
        Ok(())
    }
}
