//! Relayed byte streams.
//!
//! Each relayed datagram starts with one control byte:
//!
//! | Prefix | Meaning                       |
//! |--------|-------------------------------|
//! | `0x00` | FIN, the sender half-closed   |
//! | `0x01` | RST, the sender hard-closed   |
//! | `0x02` | DATA, payload follows         |

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::client::{RelayedDatagram, TurnClient};
use crate::core::constants::{RELAY_DATA, RELAY_FIN, RELAY_RST};
use crate::core::{NetError, NetResult};
use crate::transport::stream::{StreamBackend, StreamEvent};

/// One relayed datagram, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    /// Half-close.
    Fin,
    /// Hard-close.
    Rst,
    /// Application bytes.
    Data(Vec<u8>),
}

impl RelayFrame {
    /// Serialize with its control prefix.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RelayFrame::Fin => vec![RELAY_FIN],
            RelayFrame::Rst => vec![RELAY_RST],
            RelayFrame::Data(payload) => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.push(RELAY_DATA);
                out.extend_from_slice(payload);
                out
            }
        }
    }

    /// Parse a relayed datagram; `None` for an empty datagram or an
    /// unknown prefix.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&prefix, payload) = bytes.split_first()?;
        match prefix {
            RELAY_FIN => Some(RelayFrame::Fin),
            RELAY_RST => Some(RelayFrame::Rst),
            RELAY_DATA => Some(RelayFrame::Data(payload.to_vec())),
            _ => None,
        }
    }
}

/// Per-peer relay state. Dropping it stops the peer's refresh loops.
#[derive(Debug)]
pub(crate) struct RelayEntry {
    events: mpsc::UnboundedSender<StreamEvent>,
    loops: Vec<JoinHandle<()>>,
    local_ended: bool,
    remote_ended: bool,
}

impl RelayEntry {
    pub(crate) fn new(events: mpsc::UnboundedSender<StreamEvent>, loops: Vec<JoinHandle<()>>) -> Self {
        Self {
            events,
            loops,
            local_ended: false,
            remote_ended: false,
        }
    }
}

impl Drop for RelayEntry {
    fn drop(&mut self) {
        for task in &self.loops {
            task.abort();
        }
    }
}

/// Relay entries keyed by the peer's relayed address.
#[derive(Debug, Default)]
pub(crate) struct RelayTable {
    entries: Mutex<HashMap<SocketAddr, RelayEntry>>,
}

impl RelayTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, RelayEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the stream for `peer`. A live stream is never replaced.
    pub(crate) fn insert(&self, peer: SocketAddr, entry: RelayEntry) -> NetResult<()> {
        match self.lock().entry(peer) {
            Entry::Occupied(_) => Err(NetError::InvalidState(format!(
                "relayed stream to {peer} is already open"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub(crate) fn contains(&self, peer: &SocketAddr) -> bool {
        self.lock().contains_key(peer)
    }

    pub(crate) fn remove(&self, peer: &SocketAddr) {
        self.lock().remove(peer);
    }

    /// Close every stream and stop every refresh loop.
    pub(crate) fn clear(&self) {
        let drained: Vec<RelayEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            let _ = entry.events.send(StreamEvent::Close);
        }
    }

    fn local_end(&self, peer: &SocketAddr) {
        let mut entries = self.lock();
        let done = match entries.get_mut(peer) {
            Some(entry) => {
                entry.local_ended = true;
                entry.remote_ended
            }
            None => false,
        };
        if done {
            entries.remove(peer);
        }
    }

    /// Route one relayed datagram to its stream.
    pub(crate) fn deliver(&self, from: SocketAddr, bytes: &[u8]) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&from) else {
            tracing::warn!(from = %from, "relayed datagram from unknown peer");
            return;
        };
        match RelayFrame::decode(bytes) {
            Some(RelayFrame::Data(payload)) if !entry.remote_ended => {
                let _ = entry.events.send(StreamEvent::Data(payload));
            }
            Some(RelayFrame::Data(_)) => {
                tracing::debug!(from = %from, "relayed DATA after FIN");
            }
            Some(RelayFrame::Fin) => {
                if !entry.remote_ended {
                    entry.remote_ended = true;
                    let _ = entry.events.send(StreamEvent::End);
                }
                if entry.local_ended {
                    entries.remove(&from);
                }
            }
            Some(RelayFrame::Rst) => {
                let _ = entry.events.send(StreamEvent::Close);
                entries.remove(&from);
                tracing::debug!(from = %from, "relayed stream reset by peer");
            }
            None => {
                tracing::warn!(from = %from, len = bytes.len(), "dropping relayed datagram with unknown prefix");
            }
        }
    }
}

/// Drain the TURN client's receiver into the relay table.
pub(crate) async fn receive_loop(
    mut datagrams: mpsc::UnboundedReceiver<RelayedDatagram>,
    table: Arc<RelayTable>,
) {
    while let Some((from, bytes)) = datagrams.recv().await {
        table.deliver(from, &bytes);
    }
}

/// Stream backend writing prefixed datagrams to one peer's relay address.
pub(crate) struct RelayBackend {
    pub(crate) peer: SocketAddr,
    pub(crate) client: Arc<dyn TurnClient>,
    pub(crate) table: Arc<RelayTable>,
}

#[async_trait]
impl StreamBackend for RelayBackend {
    async fn write(&self, data: Vec<u8>) -> NetResult<()> {
        let frame = RelayFrame::Data(data).encode();
        self.client.send_to(self.peer, &frame).await
    }

    async fn end(&self) -> NetResult<()> {
        let sent = self.client.send_to(self.peer, &RelayFrame::Fin.encode()).await;
        self.table.local_end(&self.peer);
        sent
    }

    async fn destroy(&self) -> NetResult<()> {
        let sent = self.client.send_to(self.peer, &RelayFrame::Rst.encode()).await;
        self.table.remove(&self.peer);
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(RelayFrame::Fin.encode(), vec![0x00]);
        assert_eq!(RelayFrame::Rst.encode(), vec![0x01]);
        assert_eq!(RelayFrame::Data(b"hi".to_vec()).encode(), vec![0x02, b'h', b'i']);
        assert_eq!(RelayFrame::decode(&[0x02]), Some(RelayFrame::Data(Vec::new())));
        assert_eq!(RelayFrame::decode(&[0x07, 1]), None);
        assert_eq!(RelayFrame::decode(&[]), None);
    }

    #[tokio::test]
    async fn test_deliver_routes_by_sender() {
        let table = RelayTable::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.insert(addr(1), RelayEntry::new(tx, Vec::new())).unwrap();

        table.deliver(addr(2), &RelayFrame::Data(b"stranger".to_vec()).encode());
        table.deliver(addr(1), &RelayFrame::Data(b"friend".to_vec()).encode());
        assert_eq!(rx.recv().await, Some(StreamEvent::Data(b"friend".to_vec())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fin_then_local_end_removes_entry() {
        let table = RelayTable::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.insert(addr(1), RelayEntry::new(tx, Vec::new())).unwrap();

        table.deliver(addr(1), &RelayFrame::Fin.encode());
        assert_eq!(rx.recv().await, Some(StreamEvent::End));
        assert!(table.contains(&addr(1)));

        table.local_end(&addr(1));
        assert!(!table.contains(&addr(1)));
    }

    #[tokio::test]
    async fn test_rst_closes_and_stops_loops() {
        let table = RelayTable::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let refresh = tokio::spawn(std::future::pending::<()>());
        let handle = refresh.abort_handle();
        table.insert(addr(1), RelayEntry::new(tx, vec![refresh])).unwrap();

        table.deliver(addr(1), &RelayFrame::Rst.encode());
        assert_eq!(rx.recv().await, Some(StreamEvent::Close));
        assert!(!table.contains(&addr(1)));
        tokio::task::yield_now().await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_insert_keeps_live_stream() {
        let table = RelayTable::default();
        let (first, mut first_rx) = mpsc::unbounded_channel();
        let (second, mut second_rx) = mpsc::unbounded_channel();
        table.insert(addr(1), RelayEntry::new(first, Vec::new())).unwrap();

        let err = table
            .insert(addr(1), RelayEntry::new(second, Vec::new()))
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidState(_)));

        table.deliver(addr(1), &RelayFrame::Data(b"still first".to_vec()).encode());
        assert_eq!(
            first_rx.recv().await,
            Some(StreamEvent::Data(b"still first".to_vec()))
        );
        assert_eq!(second_rx.recv().await, None);
    }
}
