//! Byte stream view of a TCP flow
//!
//! [`FlowStream`] implements `AsyncRead + AsyncWrite` so the dispatcher can
//! bridge it like any socket. Reads come from the reassembled inbound byte
//! channel; writes go to the flow's egress task, which segments them into
//! packets for the device.

use super::flow::FlowKey;
use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Largest chunk handed to the egress task per write
const MAX_WRITE_CHUNK: usize = 16 * 1024;

/// Messages sent from a [`FlowStream`] to its egress task
#[derive(Debug)]
pub enum StreamMessage {
    /// Bytes toward the local application
    Data(Bytes),
    /// Graceful close; the egress task sends FIN
    Close,
}

/// A TCP flow seen as an async byte stream
pub struct FlowStream {
    key: FlowKey,
    outbound: PollSender<StreamMessage>,
    inbound: mpsc::Receiver<Bytes>,
    read_buf: BytesMut,
    eof: bool,
    shutdown: bool,
    aborted: Arc<AtomicBool>,
}

/// Ends held by the stack for one [`FlowStream`]
#[derive(Debug)]
pub struct StreamChannels {
    /// Reassembled bytes from the local application
    pub inbound_tx: mpsc::Sender<Bytes>,
    /// Messages for the egress task
    pub outbound_rx: mpsc::Receiver<StreamMessage>,
    /// Set when the stream asks for a reset instead of FIN
    pub aborted: Arc<AtomicBool>,
}

impl FlowStream {
    /// Create a stream and the channel ends the stack keeps
    pub fn new_pair(key: FlowKey, capacity: usize) -> (Self, StreamChannels) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let aborted = Arc::new(AtomicBool::new(false));

        let stream = FlowStream {
            key,
            outbound: PollSender::new(outbound_tx),
            inbound: inbound_rx,
            read_buf: BytesMut::new(),
            eof: false,
            shutdown: false,
            aborted: aborted.clone(),
        };
        let channels = StreamChannels {
            inbound_tx,
            outbound_rx,
            aborted,
        };
        (stream, channels)
    }

    /// Flow tuple
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Tear the flow down with a reset
    pub fn abort(mut self) {
        self.aborted.store(true, Ordering::Release);
        self.shutdown = true;
        self.outbound.close();
    }

    /// Whether shutdown has been initiated
    pub fn is_closed(&self) -> bool {
        self.shutdown
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "flow closed")
}

impl AsyncRead for FlowStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }
        if self.eof {
            return Poll::Ready(Ok(()));
        }

        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf.extend_from_slice(&data[n..]);
                }
                Poll::Ready(Ok(()))
            }
            // Sender dropped: FIN from the local side or flow teardown.
            Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for FlowStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shutdown {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(self.outbound.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let n = buf.len().min(MAX_WRITE_CHUNK);
        self.outbound
            .send_item(StreamMessage::Data(Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shutdown {
            return Poll::Ready(Ok(()));
        }
        if ready!(self.outbound.poll_reserve(cx)).is_ok() {
            let _ = self.outbound.send_item(StreamMessage::Close);
        }
        self.shutdown = true;
        self.outbound.close();
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for FlowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowStream")
            .field("key", &self.key)
            .field("shutdown", &self.shutdown)
            .field("eof", &self.eof)
            .field("read_buf_len", &self.read_buf.len())
            .finish()
    }
}

impl Drop for FlowStream {
    fn drop(&mut self) {
        if !self.shutdown {
            self.shutdown = true;
            if let Some(tx) = self.outbound.get_ref() {
                let _ = tx.try_send(StreamMessage::Close);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::flow::Protocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (FlowStream, StreamChannels) {
        let key = FlowKey::new(
            Protocol::Tcp,
            "10.0.0.2:40000".parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
        );
        FlowStream::new_pair(key, 8)
    }

    #[tokio::test]
    async fn test_read_partial() {
        let (mut stream, channels) = pair();
        channels
            .inbound_tx
            .send(Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");

        let mut rest = [0u8; 10];
        let n = stream.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b" world");
    }

    #[tokio::test]
    async fn test_eof_when_sender_dropped() {
        let (mut stream, channels) = pair();
        channels.inbound_tx.send(Bytes::from_static(b"x")).await.unwrap();
        drop(channels.inbound_tx);

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"x");
        assert_eq!(stream.read(&mut [0u8; 4]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_and_shutdown() {
        let (mut stream, mut channels) = pair();
        stream.write_all(b"payload").await.unwrap();
        stream.shutdown().await.unwrap();
        assert!(stream.is_closed());
        assert!(stream.write(b"more").await.is_err());

        match channels.outbound_rx.recv().await {
            Some(StreamMessage::Data(d)) => assert_eq!(&d[..], b"payload"),
            other => panic!("expected data, got {:?}", other),
        }
        assert!(matches!(channels.outbound_rx.recv().await, Some(StreamMessage::Close)));
        assert!(channels.outbound_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_sends_close() {
        let (stream, mut channels) = pair();
        drop(stream);
        assert!(matches!(channels.outbound_rx.recv().await, Some(StreamMessage::Close)));
        assert!(!channels.aborted.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_abort_marks_reset() {
        let (stream, mut channels) = pair();
        stream.abort();
        assert!(channels.aborted.load(Ordering::Acquire));
        assert!(channels.outbound_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (mut stream, mut channels) = pair();
        let data = vec![7u8; MAX_WRITE_CHUNK + 10];
        let n = stream.write(&data).await.unwrap();
        assert_eq!(n, MAX_WRITE_CHUNK);
        match channels.outbound_rx.recv().await {
            Some(StreamMessage::Data(d)) => assert_eq!(d.len(), MAX_WRITE_CHUNK),
            other => panic!("expected data, got {:?}", other),
        }
    }
}
