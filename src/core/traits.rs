//! Core traits for onetp.
//!
//! These traits define the capability contract every transport implements,
//! plus the per-transport observer channels for inbound streams and
//! transport-level errors.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::descriptor::ConnectionDescriptor;
use super::error::{NetError, NetResult};
use crate::transport::NetStream;

/// Capability contract of a concrete transport (UDP, TCP, TURN).
///
/// All operations resolve to a result or a typed failure. Malformed
/// arguments fail immediately with [`NetError::InvalidArgument`] or
/// [`NetError::TransportMismatch`] and are never retried.
///
/// # Example
///
/// ```ignore
/// let udp = UdpTransport::new(UdpConfig::default());
/// let descriptors = udp.listen(None).await?;
/// let mut incoming = udp.take_incoming().expect("first take");
/// while let Some(stream) = incoming.recv().await {
///     println!("connection from {}", stream.peer());
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable tag used to match descriptors to this transport.
    fn transport_type(&self) -> &str;

    /// Recommended timeout for one connect attempt.
    fn connect_timeout(&self) -> Duration;

    /// Start accepting connections.
    ///
    /// With no requested descriptor the transport picks its own address and
    /// may return several descriptors, one per local network interface.
    async fn listen(
        &self,
        requested: Option<&ConnectionDescriptor>,
    ) -> NetResult<Vec<ConnectionDescriptor>>;

    /// Open a stream to the peer described by `peer`.
    async fn connect(&self, peer: &ConnectionDescriptor) -> NetResult<NetStream>;

    /// Stop accepting connections and release transport resources.
    async fn close(&self) -> NetResult<()>;

    /// Take the receiver of inbound streams.
    ///
    /// Returns `None` once taken; each stream is delivered at most once.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<NetStream>>;

    /// Take the receiver of transport-level errors.
    ///
    /// Errors reported while nobody holds this receiver are logged at
    /// `error` level instead.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<NetError>>;
}

/// Single-consumer observer channel owned by a transport.
#[derive(Debug)]
pub(crate) struct EventChannel<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T> EventChannel<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<T>> {
        self.rx.lock().ok()?.take()
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<T> {
        self.tx.clone()
    }

    fn is_observed(&self) -> bool {
        self.rx.lock().map(|rx| rx.is_none()).unwrap_or(false) && !self.tx.is_closed()
    }
}

/// Error channel of a transport; escalates to the log when unobserved.
#[derive(Debug)]
pub(crate) struct ErrorSink {
    transport: &'static str,
    channel: EventChannel<NetError>,
}

impl ErrorSink {
    pub(crate) fn new(transport: &'static str) -> Self {
        Self {
            transport,
            channel: EventChannel::new(),
        }
    }

    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<NetError>> {
        self.channel.take()
    }

    pub(crate) fn report(&self, err: NetError) {
        if self.channel.is_observed() {
            if let Err(mpsc::error::SendError(err)) = self.channel.tx.send(err) {
                tracing::error!(transport = self.transport, error = %err, "unhandled transport error");
            }
        } else {
            tracing::error!(transport = self.transport, error = %err, "unhandled transport error");
        }
    }
}
