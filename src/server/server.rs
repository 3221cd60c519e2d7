//! Inbound side of the net façade.
//!
//! A [`Server`] listens on several transports at once and merges their
//! inbound streams into one queue, drained with [`Server::accept`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{ConnectionDescriptor, NetError, NetResult, Transport};
use crate::transport::NetStream;

/// Listener over a set of transports.
pub struct Server {
    transports: Vec<Arc<dyn Transport>>,
    forward: Mutex<Option<mpsc::UnboundedSender<NetStream>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<NetStream>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

/// Create a server over `transports`. Nothing listens until
/// [`Server::listen`].
pub fn create_server(transports: Vec<Arc<dyn Transport>>) -> Server {
    let (forward, incoming) = mpsc::unbounded_channel();
    Server {
        transports,
        forward: Mutex::new(Some(forward)),
        incoming: tokio::sync::Mutex::new(incoming),
        forwarders: Mutex::new(Vec::new()),
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<&str> = self.transports.iter().map(|t| t.transport_type()).collect();
        f.debug_struct("Server")
            .field("transports", &types)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Transports this server listens on.
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Start listening.
    ///
    /// With no descriptors every transport listens on an address of its
    /// own choosing. Otherwise each descriptor is routed to the transport
    /// of the same type; descriptors matching no transport are skipped and
    /// it is an error when none matches. Returns every descriptor peers can
    /// use to reach this server.
    pub async fn listen(
        &self,
        requested: Option<&[ConnectionDescriptor]>,
    ) -> NetResult<Vec<ConnectionDescriptor>> {
        let mut descriptors = Vec::new();
        match requested {
            None | Some([]) => {
                for transport in &self.transports {
                    self.forward_from(transport.as_ref())?;
                    descriptors.extend(transport.listen(None).await?);
                }
            }
            Some(requested) => {
                let mut matched = false;
                for descriptor in requested {
                    let Some(transport) = self
                        .transports
                        .iter()
                        .find(|t| t.transport_type() == descriptor.transport_type)
                    else {
                        tracing::debug!(descriptor = %descriptor, "no transport for descriptor, skipping");
                        continue;
                    };
                    matched = true;
                    self.forward_from(transport.as_ref())?;
                    descriptors.extend(transport.listen(Some(descriptor)).await?);
                }
                if !matched {
                    return Err(NetError::InvalidArgument(
                        "no requested descriptor matches a configured transport".into(),
                    ));
                }
            }
        }
        tracing::info!(count = descriptors.len(), "server listening");
        Ok(descriptors)
    }

    /// Wait for the next inbound stream from any transport.
    ///
    /// Returns `None` once the server is closed.
    pub async fn accept(&self) -> Option<NetStream> {
        self.incoming.lock().await.recv().await
    }

    /// Close every transport and end [`Self::accept`].
    ///
    /// All transports are closed even if one fails; the first failure is
    /// returned.
    pub async fn close(&self) -> NetResult<()> {
        let mut first_error = None;
        for transport in &self.transports {
            if let Err(e) = transport.close().await {
                tracing::warn!(transport = transport.transport_type(), error = %e, "transport close failed");
                first_error.get_or_insert(e);
            }
        }
        for task in self.forwarders().drain(..) {
            task.abort();
        }
        self.forward.lock().unwrap_or_else(PoisonError::into_inner).take();
        tracing::info!("server closed");
        first_error.map_or(Ok(()), Err)
    }

    fn forwarders(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pipe a transport's inbound streams into the shared queue. A no-op
    /// when the transport's receiver was already taken.
    fn forward_from(&self, transport: &dyn Transport) -> NetResult<()> {
        let forward = self
            .forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(NetError::Closed)?;
        let Some(mut streams) = transport.take_incoming() else {
            return Ok(());
        };
        let task = tokio::spawn(async move {
            while let Some(stream) = streams.recv().await {
                tracing::debug!(peer = %stream.peer(), "inbound stream");
                if forward.send(stream).is_err() {
                    break;
                }
            }
        });
        self.forwarders().push(task);
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for task in self.forwarders().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SocketInfo;
    use crate::transport::{TcpTransport, UdpTransport};

    #[tokio::test]
    async fn test_listen_on_every_transport() {
        let server = create_server(vec![
            Arc::new(UdpTransport::default()),
            Arc::new(TcpTransport::default()),
        ]);
        let descriptors = server.listen(None).await.unwrap();
        let types: Vec<&str> = descriptors.iter().map(|d| d.transport_type.as_str()).collect();
        assert!(types.contains(&"udp"));
        assert!(types.contains(&"tcp"));
        server.close().await.unwrap();
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_listen_rejects_unmatched_descriptors() {
        let server = create_server(vec![Arc::new(UdpTransport::default())]);
        let requested = [ConnectionDescriptor::tcp(SocketInfo::new("127.0.0.1", 0))];
        let err = server.listen(Some(&requested)).await.unwrap_err();
        assert!(err.is_argument_error());
    }

    #[tokio::test]
    async fn test_listen_after_close_fails() {
        let server = create_server(vec![Arc::new(UdpTransport::default())]);
        server.close().await.unwrap();
        assert!(matches!(server.listen(None).await, Err(NetError::Closed)));
    }
}
