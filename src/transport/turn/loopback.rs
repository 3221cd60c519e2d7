//! In-process TURN relay.
//!
//! [`LoopbackTurnServer`] hands out [`LoopbackTurnClient`]s whose
//! allocations live in one shared table. A datagram is relayed only when
//! the sender's allocation holds a permission for the destination and the
//! destination holds one for the sender. Every request is recorded with
//! its timestamp, and any request kind can be made to fail, which makes the
//! server useful for exercising refresh loops.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::client::{Allocation, RelayedDatagram, TurnClient};
use crate::core::{NetError, NetResult};

const RELAY_PORT_BASE: u16 = 50000;
const MAPPED_PORT_BASE: u16 = 40000;
const CHANNEL_BASE: u16 = 0x4000;

/// Kind of a TURN request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRequestKind {
    /// Allocate request.
    Allocate,
    /// Allocation refresh.
    Refresh,
    /// CreatePermission (new or refresh).
    Permission,
    /// ChannelBind (new or refresh).
    Channel,
}

/// One recorded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    /// Request kind.
    pub kind: TurnRequestKind,
    /// Relayed address of the requesting allocation, if it had one.
    pub relayed: Option<SocketAddr>,
    /// Peer named by permission and channel requests.
    pub peer: Option<SocketAddr>,
    /// When the server saw the request.
    pub at: Instant,
}

#[derive(Debug)]
struct AllocationEntry {
    permissions: HashSet<SocketAddr>,
    channels: HashMap<SocketAddr, u16>,
    inbox: mpsc::UnboundedSender<RelayedDatagram>,
}

#[derive(Debug)]
struct ServerState {
    lifetime: Option<Duration>,
    next_port: u16,
    allocations: HashMap<SocketAddr, AllocationEntry>,
    requests: Vec<TurnRequest>,
    failing: HashSet<TurnRequestKind>,
}

/// In-process TURN server.
///
/// Cheap to clone; clones share the allocation table.
#[derive(Debug, Clone)]
pub struct LoopbackTurnServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for LoopbackTurnServer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LoopbackTurnServer {
    /// Create a server granting `lifetime` on allocate, or reporting no
    /// lifetime at all with `None`.
    pub fn new(lifetime: Option<Duration>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                lifetime,
                next_port: 0,
                allocations: HashMap::new(),
                requests: Vec::new(),
                failing: HashSet::new(),
            })),
        }
    }

    /// Create a client of this server.
    pub fn client(&self) -> LoopbackTurnClient {
        let (inbox, receiver) = mpsc::unbounded_channel();
        LoopbackTurnClient {
            server: self.clone(),
            relayed: Mutex::new(None),
            inbox,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Make every following request of `kind` fail, or succeed again.
    pub fn set_failing(&self, kind: TurnRequestKind, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(kind);
        } else {
            state.failing.remove(&kind);
        }
    }

    /// Recorded requests of one kind.
    pub fn requests_of(&self, kind: TurnRequestKind) -> Vec<TurnRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServerState {
    fn record(
        &mut self,
        kind: TurnRequestKind,
        relayed: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    ) -> NetResult<()> {
        self.requests.push(TurnRequest {
            kind,
            relayed,
            peer,
            at: Instant::now(),
        });
        if self.failing.contains(&kind) {
            return Err(NetError::Relay(format!("{kind:?} request rejected")));
        }
        Ok(())
    }

    fn entry(&mut self, relayed: Option<SocketAddr>) -> NetResult<&mut AllocationEntry> {
        relayed
            .and_then(|addr| self.allocations.get_mut(&addr))
            .ok_or_else(|| NetError::Relay("no allocation".into()))
    }
}

/// Client of a [`LoopbackTurnServer`].
#[derive(Debug)]
pub struct LoopbackTurnClient {
    server: LoopbackTurnServer,
    relayed: Mutex<Option<SocketAddr>>,
    inbox: mpsc::UnboundedSender<RelayedDatagram>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<RelayedDatagram>>>,
}

impl LoopbackTurnClient {
    fn relayed(&self) -> Option<SocketAddr> {
        *self.relayed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TurnClient for LoopbackTurnClient {
    async fn allocate(&self) -> NetResult<Allocation> {
        if let Some(relayed) = self.relayed() {
            return Err(NetError::Relay(format!("already allocated {relayed}")));
        }
        let mut state = self.server.lock();
        state.record(TurnRequestKind::Allocate, None, None)?;
        state.next_port += 1;
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let relayed = SocketAddr::new(localhost, RELAY_PORT_BASE + state.next_port);
        let mapped = SocketAddr::new(localhost, MAPPED_PORT_BASE + state.next_port);
        state.allocations.insert(
            relayed,
            AllocationEntry {
                permissions: HashSet::new(),
                channels: HashMap::new(),
                inbox: self.inbox.clone(),
            },
        );
        let lifetime = state.lifetime;
        drop(state);

        *self.relayed.lock().unwrap_or_else(PoisonError::into_inner) = Some(relayed);
        Ok(Allocation {
            relayed,
            mapped,
            lifetime,
        })
    }

    async fn refresh(&self, lifetime: Duration) -> NetResult<Duration> {
        let relayed = self.relayed();
        let mut state = self.server.lock();
        state.record(TurnRequestKind::Refresh, relayed, None)?;
        state.entry(relayed)?;
        Ok(state.lifetime.unwrap_or(lifetime))
    }

    async fn create_permission(&self, peer: SocketAddr) -> NetResult<()> {
        let relayed = self.relayed();
        let mut state = self.server.lock();
        state.record(TurnRequestKind::Permission, relayed, Some(peer))?;
        state.entry(relayed)?.permissions.insert(peer);
        Ok(())
    }

    async fn bind_channel(&self, peer: SocketAddr) -> NetResult<u16> {
        let relayed = self.relayed();
        let mut state = self.server.lock();
        state.record(TurnRequestKind::Channel, relayed, Some(peer))?;
        let entry = state.entry(relayed)?;
        let next = CHANNEL_BASE + entry.channels.len() as u16;
        let channel = *entry.channels.entry(peer).or_insert(next);
        entry.permissions.insert(peer);
        Ok(channel)
    }

    async fn send_to(&self, peer: SocketAddr, data: &[u8]) -> NetResult<()> {
        let relayed = self
            .relayed()
            .ok_or_else(|| NetError::Relay("no allocation".into()))?;
        let state = self.server.lock();
        let allowed = state
            .allocations
            .get(&relayed)
            .is_some_and(|own| own.permissions.contains(&peer));
        match state.allocations.get(&peer) {
            Some(dest) if allowed && dest.permissions.contains(&relayed) => {
                let _ = dest.inbox.send((relayed, data.to_vec()));
            }
            _ => tracing::debug!(from = %relayed, to = %peer, "loopback relay dropped datagram"),
        }
        Ok(())
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<RelayedDatagram>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) -> NetResult<()> {
        let relayed = self
            .relayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(relayed) = relayed {
            self.server.lock().allocations.remove(&relayed);
        }
        Ok(())
    }
}
