//! Connection bookkeeping for introspection

use super::{DatagramDyn, Handler, StreamDyn};
use crate::error::Result;
use crate::route::TargetAddr;
use crate::stack::Protocol;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

/// Open outbound connection as listed for introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Registry id
    pub id: u64,
    /// Handler that opened it
    pub handler: String,
    /// Stream or datagram
    pub protocol: Protocol,
    /// Destination
    pub target: TargetAddr,
    /// When it was opened
    pub opened_at: SystemTime,
    /// Bytes sent toward the target
    pub uploaded: u64,
    /// Bytes received from the target
    pub downloaded: u64,
}

#[derive(Debug)]
struct Entry {
    handler: String,
    protocol: Protocol,
    target: TargetAddr,
    opened_at: SystemTime,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

/// Shared table of open outbound connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: DashMap<u64, Arc<Entry>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn register(self: &Arc<Self>, handler: &str, protocol: Protocol, target: &TargetAddr) -> Guard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            handler: handler.to_string(),
            protocol,
            target: target.clone(),
            opened_at: SystemTime::now(),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        });
        self.entries.insert(id, entry.clone());
        trace!("Registered connection {} to {}", id, target);
        Guard {
            id,
            entry,
            registry: self.clone(),
        }
    }

    /// Snapshot of every open connection, oldest first
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .entries
            .iter()
            .map(|e| ConnectionInfo {
                id: *e.key(),
                handler: e.handler.clone(),
                protocol: e.protocol,
                target: e.target.clone(),
                opened_at: e.opened_at,
                uploaded: e.uploaded.load(Ordering::Relaxed),
                downloaded: e.downloaded.load(Ordering::Relaxed),
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connection is open
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry entry that unregisters on drop
struct Guard {
    id: u64,
    entry: Arc<Entry>,
    registry: Arc<ConnectionRegistry>,
}

impl Guard {
    fn uploaded(&self, n: usize) {
        self.entry.uploaded.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn downloaded(&self, n: usize) {
        self.entry.downloaded.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.registry.entries.remove(&self.id);
        trace!("Unregistered connection {}", self.id);
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("id", &self.id).finish()
    }
}

/// Handler wrapper that records every connection it opens
#[derive(Debug, Clone)]
pub struct Recorder {
    inner: Arc<dyn Handler>,
    registry: Arc<ConnectionRegistry>,
}

impl Recorder {
    /// Wrap `inner`, recording into `registry`
    pub fn new(inner: Arc<dyn Handler>, registry: Arc<ConnectionRegistry>) -> Self {
        Recorder { inner, registry }
    }

    /// Registry shared with other recorders
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

#[async_trait]
impl Handler for Recorder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn open_stream(&self, target: &TargetAddr) -> Result<Box<dyn StreamDyn>> {
        let inner = self.inner.open_stream(target).await?;
        let guard = self.registry.register(self.name(), Protocol::Tcp, target);
        Ok(Box::new(RecordedStream { inner, guard }))
    }

    async fn open_datagram(&self, target: &TargetAddr) -> Result<Box<dyn DatagramDyn>> {
        let inner = self.inner.open_datagram(target).await?;
        let guard = self.registry.register(self.name(), Protocol::Udp, target);
        Ok(Box::new(RecordedDatagram { inner, guard }))
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.list()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[derive(Debug)]
struct RecordedStream {
    inner: Box<dyn StreamDyn>,
    guard: Guard,
}

impl AsyncRead for RecordedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.guard.downloaded(buf.filled().len() - before);
        }
        poll
    }
}

impl AsyncWrite for RecordedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.guard.uploaded(n);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Debug)]
struct RecordedDatagram {
    inner: Box<dyn DatagramDyn>,
    guard: Guard,
}

#[async_trait]
impl DatagramDyn for RecordedDatagram {
    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.inner.send(payload).await?;
        self.guard.uploaded(payload.len());
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.recv(buf).await?;
        self.guard.downloaded(n);
        Ok(n)
    }
}
