//! Contract of the TURN client used by [`super::TurnTransport`].
//!
//! STUN message encoding, credentials and per-request retransmission live
//! behind this trait. The transport only drives the allocation lifecycle
//! and relays datagrams through it.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::NetResult;

/// Datagram received through the relay: sender's relayed address and bytes.
pub type RelayedDatagram = (SocketAddr, Vec<u8>);

/// Result of a successful allocate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Address on the TURN server that peers send to.
    pub relayed: SocketAddr,
    /// Our server-reflexive address as seen by the TURN server.
    pub mapped: SocketAddr,
    /// Lease granted by the server, if it reported one.
    pub lifetime: Option<Duration>,
}

/// One TURN client, holding at most one allocation.
#[async_trait]
pub trait TurnClient: Send + Sync {
    /// Request a relay allocation.
    async fn allocate(&self) -> NetResult<Allocation>;

    /// Refresh the allocation, asking for `lifetime`; returns the granted
    /// lifetime.
    async fn refresh(&self, lifetime: Duration) -> NetResult<Duration>;

    /// Install or refresh a permission for `peer`'s relayed address.
    async fn create_permission(&self, peer: SocketAddr) -> NetResult<()>;

    /// Bind or refresh a channel to `peer`; returns the channel number.
    async fn bind_channel(&self, peer: SocketAddr) -> NetResult<u16>;

    /// Relay `data` to `peer`.
    async fn send_to(&self, peer: SocketAddr, data: &[u8]) -> NetResult<()>;

    /// Take the receiver of relayed datagrams. Returns `None` once taken.
    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<RelayedDatagram>>;

    /// Release the allocation.
    async fn close(&self) -> NetResult<()>;
}
