//! TCP transport.
//!
//! Every TCP connection is wrapped in a proxy stream, so application bytes
//! only flow after the PING/PONG rendezvous.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::proxy;
use super::retry::RetryConfig;
use super::stream::NetStream;
use crate::core::constants::{PROTOCOL_VERSION, TCP_CONNECT_TIMEOUT, TRANSPORT_TCP};
use crate::core::{
    ConnectionDescriptor, ErrorSink, EventChannel, NetError, NetResult, SocketInfo, Transport,
};

/// TCP transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Address to bind when `listen` gets no descriptor.
    pub bind_addr: Option<SocketAddr>,
    /// Addresses advertised by `listen`, one descriptor each.
    pub local_addresses: Vec<IpAddr>,
    /// Recommended per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// PING schedule of the proxy handshake.
    pub handshake: RetryConfig,
    /// Version advertised in descriptors.
    pub version: String,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            local_addresses: Vec::new(),
            connect_timeout: TCP_CONNECT_TIMEOUT,
            handshake: RetryConfig::default(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl TcpConfig {
    /// Bind to a fixed address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Advertise these addresses instead of the bound one.
    pub fn with_local_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.local_addresses = addresses;
        self
    }

    /// Set the proxy handshake schedule.
    pub fn with_handshake(mut self, handshake: RetryConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Set the recommended connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

struct Listening {
    local: SocketAddr,
    task: JoinHandle<()>,
}

/// Direct TCP transport.
pub struct TcpTransport {
    config: TcpConfig,
    listening: Mutex<Option<Listening>>,
    incoming: EventChannel<NetStream>,
    errors: Arc<ErrorSink>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("config", &self.config)
            .field("local", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TcpConfig::default())
    }
}

impl TcpTransport {
    /// Create a transport that is not listening yet.
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            listening: Mutex::new(None),
            incoming: EventChannel::new(),
            errors: Arc::new(ErrorSink::new(TRANSPORT_TCP)),
        }
    }

    /// Local address of the listener, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| l.local)
    }

    fn advertised(&self, local: SocketAddr) -> Vec<ConnectionDescriptor> {
        let addresses = if self.config.local_addresses.is_empty() {
            if local.ip().is_unspecified() {
                vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
            } else {
                vec![local.ip()]
            }
        } else {
            self.config.local_addresses.clone()
        };
        addresses
            .into_iter()
            .map(|ip| {
                let mut descriptor =
                    ConnectionDescriptor::tcp(SocketInfo::from(SocketAddr::new(ip, local.port())));
                descriptor.version = self.config.version.clone();
                descriptor
            })
            .collect()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let listening = self
            .listening
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listening) = listening {
            listening.task.abort();
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &str {
        TRANSPORT_TCP
    }

    fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    async fn listen(
        &self,
        requested: Option<&ConnectionDescriptor>,
    ) -> NetResult<Vec<ConnectionDescriptor>> {
        let addr = match requested {
            Some(descriptor) => descriptor.socket_addr(TRANSPORT_TCP)?,
            None => self
                .config
                .bind_addr
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
        };
        if let Some(local) = self.local_addr() {
            return Err(NetError::InvalidState(format!(
                "already listening on {local}"
            )));
        }

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(
            listener,
            self.config.handshake,
            self.incoming.sender(),
            Arc::clone(&self.errors),
        ));
        *self.listening.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Listening { local, task });

        let descriptors = self.advertised(local);
        tracing::info!(local = %local, count = descriptors.len(), "tcp transport listening");
        Ok(descriptors)
    }

    async fn connect(&self, peer: &ConnectionDescriptor) -> NetResult<NetStream> {
        let addr = peer.socket_addr(TRANSPORT_TCP)?;
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let stream = proxy::connect(socket, peer.clone(), self.config.handshake).await?;
        tracing::info!(peer = %addr, "tcp stream established");
        Ok(stream)
    }

    async fn close(&self) -> NetResult<()> {
        let listening = self
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listening) = listening {
            listening.task.abort();
            tracing::info!(local = %listening.local, "tcp transport closed");
        }
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<NetStream>> {
        self.incoming.take()
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<NetError>> {
        self.errors.take()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handshake: RetryConfig,
    incoming: mpsc::UnboundedSender<NetStream>,
    errors: Arc<ErrorSink>,
) {
    loop {
        let (socket, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                errors.report(NetError::Io(e));
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let incoming = incoming.clone();
        tokio::spawn(async move {
            let _ = socket.set_nodelay(true);
            let peer = ConnectionDescriptor::tcp(SocketInfo::from(from));
            match proxy::accept(socket, peer, handshake).await {
                Ok(stream) => {
                    tracing::info!(peer = %from, "tcp stream accepted");
                    let _ = incoming.send(stream);
                }
                Err(e) => {
                    tracing::debug!(peer = %from, error = %e, "inbound tcp handshake failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local() -> TcpConfig {
        TcpConfig::default().with_bind_addr("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let server = TcpTransport::new(local());
        let descriptors = server.listen(None).await.unwrap();
        let mut incoming = server.take_incoming().unwrap();

        let client = TcpTransport::default();
        let mut outbound = client.connect(&descriptors[0]).await.unwrap();
        let mut inbound = incoming.recv().await.unwrap();

        outbound.write_all(b"over tcp").await.unwrap();
        outbound.shutdown().await.unwrap();
        let mut got = Vec::new();
        inbound.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"over tcp");

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let server = TcpTransport::new(local());
        server.listen(None).await.unwrap();
        let err = server.listen(None).await.unwrap_err();
        assert!(matches!(err, NetError::InvalidState(_)));
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let client = TcpTransport::default();
        let err = client
            .connect(&ConnectionDescriptor::tcp(SocketInfo::from(addr)))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Io(_)));
    }

    #[tokio::test]
    async fn test_udp_descriptor_rejected() {
        let client = TcpTransport::default();
        let udp = ConnectionDescriptor::udp(SocketInfo::new("127.0.0.1", 1));
        assert!(client.connect(&udp).await.unwrap_err().is_argument_error());
        assert!(client.listen(Some(&udp)).await.unwrap_err().is_argument_error());
    }
}
