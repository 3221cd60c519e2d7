//! UDP session state machine.
//!
//! One [`UdpSession`] per logical stream multiplexed over a shared datagram
//! socket. Control exchanges (SYN, FIN, RST) go through the
//! [`RetryManager`] keyed by their transaction ID and are confirmed from
//! [`UdpSession::process_packet`] when the matching reply arrives.
//!
//! ```text
//!   INIT ──init_handshake/respond──► CONNECTING ──confirm──► CONNECTED
//!                                        │                      │
//!                               abort / timeout          end / destroy
//!                                        ▼                      ▼
//!                                     ABORTED               CLOSING ──► CLOSED
//! ```

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::packet::{MessageType, Packet};
use super::retry::{RetryConfig, RetryManager};
use super::socket::PacketSender;
use super::stream::{StreamBackend, StreamEvent};
use crate::core::{NetError, NetResult, SessionId, TransactionId};

/// Lifecycle state of a UDP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no handshake yet.
    Init,
    /// Handshake in flight.
    Connecting,
    /// Handshake done, data flows.
    Connected,
    /// Local side ended or destroyed the stream.
    Closing,
    /// Terminal: closed in both directions.
    Closed,
    /// Terminal: handshake cancelled or timed out.
    Aborted,
}

impl SessionState {
    /// Check if the session can never be used again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted)
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    handshake: Option<TransactionId>,
    local_ended: bool,
    remote_ended: bool,
    events: Option<mpsc::UnboundedSender<StreamEvent>>,
    receiver: Option<mpsc::UnboundedReceiver<StreamEvent>>,
}

/// One stream over a shared UDP socket.
///
/// Control packets are retransmitted until acknowledged; DATA is not.
#[derive(Debug)]
pub struct UdpSession {
    id: SessionId,
    peer: SocketAddr,
    sender: PacketSender,
    retry: RetryManager,
    timing: RetryConfig,
    reaper: mpsc::UnboundedSender<SessionId>,
    inner: Mutex<SessionInner>,
}

impl UdpSession {
    /// Create a session in `Init`.
    ///
    /// `reaper` is told the session ID once the session reaches a terminal
    /// state, so the owning transport can drop it from its table.
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        sender: PacketSender,
        timing: RetryConfig,
        reaper: mpsc::UnboundedSender<SessionId>,
    ) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            id,
            peer,
            sender,
            retry: RetryManager::new(timing),
            timing,
            reaper,
            inner: Mutex::new(SessionInner {
                state: SessionState::Init,
                handshake: None,
                local_ended: false,
                remote_ended: false,
                events: Some(events),
                receiver: Some(receiver),
            }),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Remote socket address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Take the inbound event receiver to build a stream from.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.lock().receiver.take()
    }

    /// Initiator side: SYN until SYN_ACK, then ACK.
    pub async fn init_handshake(&self) -> NetResult<()> {
        let tid = TransactionId::generate();
        self.begin_handshake(&tid)?;
        tracing::debug!(session = %self.id, peer = %self.peer, tid = %tid, "sending SYN");

        let syn = Packet::control(MessageType::Syn, self.id.clone(), &tid);
        let result = self
            .retry
            .execute_until_confirmed_with(tid.as_str(), &self.timing, || {
                self.sender.send(&syn, self.peer)
            })
            .await;

        match result {
            Ok(()) => {
                if !self.finish_handshake() {
                    return Err(NetError::Aborted);
                }
                let ack = Packet::control(MessageType::Ack, self.id.clone(), &tid);
                self.sender.send(&ack, self.peer).await?;
                tracing::debug!(session = %self.id, peer = %self.peer, "session connected");
                Ok(())
            }
            Err(e) => {
                self.fail_handshake();
                Err(e)
            }
        }
    }

    /// Responder side: answer `syn` with SYN_ACK until ACK.
    pub async fn respond(&self, syn: &Packet) -> NetResult<()> {
        let tid = syn
            .transaction_id()
            .ok_or_else(|| NetError::ProtocolViolation("SYN without transaction id".into()))?;
        self.begin_handshake(&tid)?;
        tracing::debug!(session = %self.id, peer = %self.peer, tid = %tid, "sending SYN_ACK");

        let syn_ack = Packet::control(MessageType::SynAck, self.id.clone(), &tid);
        let result = self
            .retry
            .execute_until_confirmed_with(tid.as_str(), &self.timing, || {
                self.sender.send(&syn_ack, self.peer)
            })
            .await;

        match result {
            Ok(()) if self.finish_handshake() => {
                tracing::debug!(session = %self.id, peer = %self.peer, "session accepted");
                Ok(())
            }
            Ok(()) => Err(NetError::Aborted),
            Err(e) => {
                self.fail_handshake();
                Err(e)
            }
        }
    }

    /// Cancel an in-flight handshake.
    ///
    /// Only legal while `Connecting`; the pending `init_handshake` or
    /// `respond` call fails with [`NetError::Aborted`].
    pub fn abort_handshake(&self) -> NetResult<()> {
        let tid = {
            let mut inner = self.lock();
            if inner.state != SessionState::Connecting {
                return Err(NetError::InvalidState(format!(
                    "cannot abort handshake in state {:?}",
                    inner.state
                )));
            }
            inner.state = SessionState::Aborted;
            inner.events = None;
            inner.handshake.clone()
        };
        if let Some(tid) = tid {
            self.retry.abort(tid.as_str());
        }
        tracing::debug!(session = %self.id, "handshake aborted");
        let _ = self.reaper.send(self.id.clone());
        Ok(())
    }

    /// Close locally without telling the peer.
    pub fn terminate(&self) {
        if let Some(events) = &self.lock().events {
            let _ = events.send(StreamEvent::Close);
        }
        self.close();
    }

    /// Handle one inbound packet addressed to this session.
    pub fn process_packet(&self, packet: Packet) {
        match packet.kind {
            MessageType::SynAck => self.on_syn_ack(&packet),
            MessageType::Ack => self.on_ack(&packet),
            MessageType::Data => self.on_data(packet.payload),
            MessageType::Fin => self.on_fin(&packet),
            MessageType::Rst => self.on_rst(&packet),
            kind => {
                tracing::debug!(session = %self.id, ?kind, state = ?self.state(), "dropping unexpected packet");
            }
        }
    }

    fn on_syn_ack(&self, packet: &Packet) {
        let Some(tid) = packet.transaction_id() else {
            tracing::debug!(session = %self.id, "SYN_ACK without transaction id");
            return;
        };
        if self.confirm_handshake(&tid) {
            return;
        }
        // Our ACK got lost; the responder is still retransmitting.
        if self.state() == SessionState::Connected {
            self.acknowledge(&tid);
        }
    }

    fn on_ack(&self, packet: &Packet) {
        match packet.transaction_id() {
            Some(tid) if self.confirm_handshake(&tid) || self.retry.confirm(tid.as_str()) => {}
            _ => tracing::debug!(session = %self.id, "dropping stray ACK"),
        }
    }

    /// Confirm the pending handshake exchange and enter `Connected` under
    /// the same lock.
    fn confirm_handshake(&self, tid: &TransactionId) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Connecting || inner.handshake.as_ref() != Some(tid) {
            return false;
        }
        if !self.retry.confirm(tid.as_str()) {
            return false;
        }
        inner.state = SessionState::Connected;
        true
    }

    fn on_data(&self, payload: Vec<u8>) {
        let implicit_ack = {
            let inner = self.lock();
            match inner.state {
                SessionState::Connected | SessionState::Closing if !inner.remote_ended => {
                    if let Some(events) = &inner.events {
                        let _ = events.send(StreamEvent::Data(payload));
                    }
                    return;
                }
                SessionState::Connecting => inner.handshake.clone(),
                state => {
                    tracing::debug!(session = %self.id, ?state, "dropping DATA");
                    return;
                }
            }
        };
        // The initiator only sends DATA once it saw our SYN_ACK, so DATA
        // overtaking a lost ACK completes the responder handshake.
        if let Some(tid) = implicit_ack {
            if self.confirm_handshake(&tid) {
                self.on_data(payload);
            }
        }
    }

    fn on_fin(&self, packet: &Packet) {
        let Some(tid) = packet.transaction_id() else {
            return;
        };
        let closed = {
            let mut inner = self.lock();
            if !matches!(inner.state, SessionState::Connected | SessionState::Closing) {
                drop(inner);
                tracing::debug!(session = %self.id, "dropping FIN outside of session");
                return;
            }
            if !inner.remote_ended {
                inner.remote_ended = true;
                if let Some(events) = &inner.events {
                    let _ = events.send(StreamEvent::End);
                }
            }
            inner.local_ended
        };
        self.acknowledge(&tid);
        if closed {
            self.close();
        }
    }

    fn on_rst(&self, packet: &Packet) {
        let Some(tid) = packet.transaction_id() else {
            return;
        };
        {
            let inner = self.lock();
            if inner.state.is_terminal() || inner.state == SessionState::Init {
                return;
            }
            if let Some(events) = &inner.events {
                let _ = events.send(StreamEvent::Close);
            }
        }
        self.acknowledge(&tid);
        tracing::debug!(session = %self.id, "reset by peer");
        self.close();
    }

    fn acknowledge(&self, tid: &TransactionId) {
        let ack = Packet::control(MessageType::Ack, self.id.clone(), tid);
        if let Err(e) = self.sender.try_send(&ack, self.peer) {
            tracing::debug!(session = %self.id, error = %e, "failed to send ACK");
        }
    }

    fn begin_handshake(&self, tid: &TransactionId) -> NetResult<()> {
        let mut inner = self.lock();
        if inner.state != SessionState::Init {
            return Err(NetError::InvalidState(format!(
                "handshake requires INIT, session is {:?}",
                inner.state
            )));
        }
        inner.state = SessionState::Connecting;
        inner.handshake = Some(tid.clone());
        Ok(())
    }

    fn finish_handshake(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == SessionState::Connecting {
            inner.state = SessionState::Connected;
            true
        } else {
            inner.state == SessionState::Connected
        }
    }

    fn fail_handshake(&self) {
        let reap = {
            let mut inner = self.lock();
            if inner.state == SessionState::Connecting {
                inner.state = SessionState::Aborted;
                inner.events = None;
                true
            } else {
                false
            }
        };
        if reap {
            let _ = self.reaper.send(self.id.clone());
        }
    }

    fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = SessionState::Closed;
            inner.events = None;
        }
        tracing::debug!(session = %self.id, "session closed");
        let _ = self.reaper.send(self.id.clone());
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn exchange(&self, kind: MessageType) -> NetResult<()> {
        let tid = TransactionId::generate();
        let packet = Packet::control(kind, self.id.clone(), &tid);
        self.retry
            .execute_until_confirmed_with(tid.as_str(), &self.timing, || {
                self.sender.send(&packet, self.peer)
            })
            .await
    }
}

#[async_trait]
impl StreamBackend for UdpSession {
    async fn write(&self, data: Vec<u8>) -> NetResult<()> {
        {
            let inner = self.lock();
            if inner.state != SessionState::Connected || inner.local_ended {
                return Err(NetError::Closed);
            }
        }
        self.sender
            .send(&Packet::data(self.id.clone(), data), self.peer)
            .await
    }

    async fn end(&self) -> NetResult<()> {
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Connected {
                return Err(NetError::InvalidState(format!(
                    "cannot end session in state {:?}",
                    inner.state
                )));
            }
            inner.state = SessionState::Closing;
        }
        tracing::debug!(session = %self.id, "sending FIN");
        let result = self.exchange(MessageType::Fin).await;

        let closed = {
            let mut inner = self.lock();
            inner.local_ended = true;
            inner.remote_ended || result.is_err()
        };
        if closed {
            if result.is_err() {
                if let Some(events) = &self.lock().events {
                    let _ = events.send(StreamEvent::Close);
                }
            }
            self.close();
        }
        result
    }

    async fn destroy(&self) -> NetResult<()> {
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return Ok(());
            }
            inner.state = SessionState::Closing;
        }
        tracing::debug!(session = %self.id, "sending RST");
        let result = self.exchange(MessageType::Rst).await;
        self.close();
        result
    }
}
