//! In-memory packet device

use super::Device;
use crate::error::{Result, TunratsError};
use async_trait::async_trait;
use bytes::Bytes;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Packets queued in each direction
const CHANNEL_CAPACITY: usize = 1024;

/// Device whose packets come from and go to a [`ChannelPeer`]
#[derive(Debug)]
pub struct ChannelDevice {
    name: String,
    mtu: usize,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
    addresses: Mutex<Vec<IpNet>>,
    routes: Mutex<Vec<IpNet>>,
    active: AtomicBool,
    closed: CancellationToken,
}

/// The far end of a [`ChannelDevice`]
#[derive(Debug)]
pub struct ChannelPeer {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelDevice {
    /// Create a device and its peer
    pub fn pair(name: &str, mtu: usize) -> (Self, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let device = ChannelDevice {
            name: name.to_string(),
            mtu,
            inbound: tokio::sync::Mutex::new(in_rx),
            outbound: out_tx,
            addresses: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            closed: CancellationToken::new(),
        };
        (device, ChannelPeer { tx: in_tx, rx: out_rx })
    }

    /// Addresses assigned so far
    pub fn addresses(&self) -> Vec<IpNet> {
        self.addresses.lock().clone()
    }

    /// Routes added so far
    pub fn routes(&self) -> Vec<IpNet> {
        self.routes.lock().clone()
    }

    /// Whether `activate` has been called
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Device for ChannelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(0),
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Ok(0),
            },
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
    }

    async fn set_interface_address(&self, addr: IpNet) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TunratsError::Device("device closed".into()));
        }
        self.addresses.lock().push(addr);
        Ok(())
    }

    async fn activate(&self) -> Result<()> {
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    async fn add_routes(&self, routes: &[IpNet]) -> Result<()> {
        self.routes.lock().extend_from_slice(routes);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing channel device {}", self.name);
        self.closed.cancel();
        Ok(())
    }
}

impl ChannelPeer {
    /// Inject a packet toward the stack
    pub async fn send(&self, packet: impl Into<Bytes>) -> io::Result<()> {
        self.tx
            .send(packet.into())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device dropped"))
    }

    /// Next packet written by the stack
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next packet written by the stack, or `None` after `wait`
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Bytes> {
        tokio::time::timeout(wait, self.rx.recv()).await.ok().flatten()
    }

    /// Packet already written by the stack, without waiting
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_device_roundtrip() {
        let (device, mut peer) = ChannelDevice::pair("test0", 1500);
        assert_eq!(device.name(), "test0");
        assert_eq!(device.mtu(), 1500);

        peer.send(vec![1u8, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = device.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        device.send(&[9, 8]).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().as_ref(), &[9, 8]);
    }

    #[tokio::test]
    async fn test_channel_device_close_ends_recv() {
        let (device, _peer) = ChannelDevice::pair("test0", 1500);
        let device = std::sync::Arc::new(device);
        let reader = {
            let device = device.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                device.recv(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        device.close().await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), 0);
        assert!(device.send(&[1]).await.is_err());
        assert!(device.is_closed());
    }

    #[tokio::test]
    async fn test_channel_device_configuration() {
        let (device, _peer) = ChannelDevice::pair("test0", 1500);
        device
            .set_interface_address("10.0.0.1/24".parse().unwrap())
            .await
            .unwrap();
        device
            .add_routes(&["198.18.0.0/16".parse().unwrap()])
            .await
            .unwrap();
        assert!(!device.is_active());
        device.activate().await.unwrap();
        assert!(device.is_active());
        assert_eq!(device.addresses().len(), 1);
        assert_eq!(device.routes()[0].to_string(), "198.18.0.0/16");
    }
}
