//! Application-facing byte stream.
//!
//! Every transport hands out a [`NetStream`]. It is a tokio duplex pipe whose
//! far end is pumped by a task against a [`StreamBackend`]: bytes written by
//! the application become backend writes, backend events become bytes (or
//! end-of-stream) on the read side.
//!
//! ```text
//!  application            pump task                  backend
//!  write()  ──► pipe ──►  read chunk ──► write(chunk) ──► DATA packet
//!  shutdown() ─────────►  EOF        ──► end()        ──► FIN exchange
//!  destroy()  ─────────►  command    ──► destroy()    ──► RST exchange
//!  read()   ◄── pipe ◄──  StreamEvent::Data / End / Close ◄── peer
//! ```

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::core::constants::{MAX_DATA_CHUNK, STREAM_PIPE_CAPACITY};
use crate::core::{ConnectionDescriptor, NetError, NetResult};

/// Inbound event delivered by a backend to its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Payload bytes for the read side.
    Data(Vec<u8>),
    /// The peer half-closed; the read side sees end-of-stream.
    End,
    /// The stream is gone; both sides close.
    Close,
}

/// Outbound half of a stream implementation.
#[async_trait]
pub trait StreamBackend: Send + Sync + 'static {
    /// Send application bytes to the peer.
    async fn write(&self, data: Vec<u8>) -> NetResult<()>;

    /// Half-close: no more writes from this side.
    async fn end(&self) -> NetResult<()>;

    /// Hard-close the stream in both directions.
    async fn destroy(&self) -> NetResult<()>;
}

enum Command {
    Destroy(oneshot::Sender<NetResult<()>>),
}

/// Bidirectional byte stream to a peer.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. `shutdown()` half-closes,
/// [`NetStream::destroy`] hard-closes. Dropping the stream without either
/// behaves like `shutdown()`.
#[derive(Debug)]
pub struct NetStream {
    io: DuplexStream,
    control: mpsc::UnboundedSender<Command>,
    peer: ConnectionDescriptor,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Destroy")
    }
}

impl NetStream {
    /// Wire a backend and its inbound events into a new stream.
    pub fn spawn(
        backend: Arc<dyn StreamBackend>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        peer: ConnectionDescriptor,
    ) -> Self {
        let (io, internal) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
        let (control, commands) = mpsc::unbounded_channel();
        tokio::spawn(pump(internal, backend, events, commands, peer.clone()));
        Self { io, control, peer }
    }

    /// Descriptor of the remote endpoint.
    pub fn peer(&self) -> &ConnectionDescriptor {
        &self.peer
    }

    /// Hard-close the stream and wait for the peer to acknowledge.
    pub async fn destroy(self) -> NetResult<()> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(Command::Destroy(ack))
            .map_err(|_| NetError::Closed)?;
        done.await.map_err(|_| NetError::Closed)?
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

async fn pump(
    internal: DuplexStream,
    backend: Arc<dyn StreamBackend>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    peer: ConnectionDescriptor,
) {
    let (mut from_app, mut to_app) = tokio::io::split(internal);
    let mut buf = vec![0u8; MAX_DATA_CHUNK];
    let mut writing = true;
    let mut reading = true;
    let mut controlled = true;

    while writing || reading {
        tokio::select! {
            read = from_app.read(&mut buf), if writing => match read {
                Ok(0) | Err(_) => {
                    writing = false;
                    if let Err(e) = backend.end().await {
                        tracing::debug!(peer = %peer, error = %e, "half-close failed");
                    }
                }
                Ok(n) => match backend.write(buf[..n].to_vec()).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::debug!(peer = %peer, error = %e, "write failed, closing stream");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "dropping chunk");
                    }
                },
            },
            event = events.recv(), if reading => match event {
                Some(StreamEvent::Data(data)) => {
                    if to_app.write_all(&data).await.is_err() {
                        tracing::trace!(peer = %peer, "read side dropped, discarding data");
                    }
                }
                Some(StreamEvent::End) => {
                    reading = false;
                    let _ = to_app.shutdown().await;
                }
                Some(StreamEvent::Close) | None => break,
            },
            command = commands.recv(), if controlled => match command {
                Some(Command::Destroy(ack)) => {
                    let result = backend.destroy().await;
                    let _ = ack.send(result);
                    break;
                }
                None => controlled = false,
            },
        }
    }
    tracing::trace!(peer = %peer, "stream pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SocketInfo;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<Vec<u8>>>,
        ended: Mutex<bool>,
        destroyed: Mutex<bool>,
        reject_next: Mutex<bool>,
    }

    #[async_trait]
    impl StreamBackend for Recorder {
        async fn write(&self, data: Vec<u8>) -> NetResult<()> {
            if std::mem::take(&mut *self.reject_next.lock().unwrap()) {
                return Err(NetError::RetriesExhausted);
            }
            self.writes.lock().unwrap().push(data);
            Ok(())
        }

        async fn end(&self) -> NetResult<()> {
            *self.ended.lock().unwrap() = true;
            Ok(())
        }

        async fn destroy(&self) -> NetResult<()> {
            *self.destroyed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn peer() -> ConnectionDescriptor {
        ConnectionDescriptor::udp(SocketInfo::new("127.0.0.1", 1))
    }

    #[tokio::test]
    async fn test_events_reach_reader() {
        let backend = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = NetStream::spawn(backend, rx, peer());

        tx.send(StreamEvent::Data(b"hello ".to_vec())).unwrap();
        tx.send(StreamEvent::Data(b"world".to_vec())).unwrap();
        tx.send(StreamEvent::End).unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_writes_are_chunked_and_shutdown_ends() {
        let backend = Arc::new(Recorder::default());
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut stream = NetStream::spawn(backend.clone(), rx, peer());

        let payload = vec![7u8; MAX_DATA_CHUNK * 2 + 10];
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        while !*backend.ended.lock().unwrap() {
            tokio::task::yield_now().await;
        }
        let writes = backend.writes.lock().unwrap();
        assert!(writes.iter().all(|w| w.len() <= MAX_DATA_CHUNK));
        assert_eq!(writes.concat(), payload);

        assert!(stream.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_reaches_backend() {
        let backend = Arc::new(Recorder::default());
        let (_tx, rx) = mpsc::unbounded_channel();
        let stream = NetStream::spawn(backend.clone(), rx, peer());

        stream.destroy().await.unwrap();
        assert!(*backend.destroyed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_close_event_ends_reader() {
        let backend = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = NetStream::spawn(backend, rx, peer());

        tx.send(StreamEvent::Close).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_non_fatal_write_error_keeps_stream_open() {
        let backend = Arc::new(Recorder::default());
        *backend.reject_next.lock().unwrap() = true;
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut stream = NetStream::spawn(backend.clone(), rx, peer());

        stream.write_all(b"lost").await.unwrap();
        while *backend.reject_next.lock().unwrap() {
            tokio::task::yield_now().await;
        }
        stream.write_all(b"kept").await.unwrap();
        stream.shutdown().await.unwrap();

        while !*backend.ended.lock().unwrap() {
            tokio::task::yield_now().await;
        }
        assert_eq!(*backend.writes.lock().unwrap(), vec![b"kept".to_vec()]);
    }
}
