//! UDP transport.
//!
//! One datagram socket per transport instance, shared by every session.
//! A demultiplexer task owns the socket's receive side and the session
//! table; it routes packets by session ID and creates responder sessions
//! for unmatched SYNs while the transport accepts connections.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::packet::{MessageType, Packet};
use super::retry::RetryConfig;
use super::session::{SessionState, UdpSession};
use super::socket::{DatagramSocket, PacketSender};
use super::stream::NetStream;
use crate::core::constants::{
    PROTOCOL_VERSION, TRANSPORT_UDP, UDP_CONNECT_TIMEOUT, UDP_RETRANSMISSION_DELAY, UDP_RETRIES,
};
use crate::core::{
    ConnectionDescriptor, ErrorSink, EventChannel, NetError, NetResult, SessionId, SocketInfo,
    Transport,
};

/// UDP transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Address to bind when `listen` gets no descriptor. Defaults to an
    /// ephemeral port on all interfaces.
    pub bind_addr: Option<SocketAddr>,
    /// Addresses advertised by `listen`, one descriptor each. When empty
    /// the bound address is advertised.
    pub local_addresses: Vec<IpAddr>,
    /// Delay between control packet retransmissions.
    pub retransmission_delay: Duration,
    /// Retransmissions before a control exchange gives up.
    pub retries: u32,
    /// Recommended per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Version advertised in descriptors.
    pub version: String,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            local_addresses: Vec::new(),
            retransmission_delay: UDP_RETRANSMISSION_DELAY,
            retries: UDP_RETRIES,
            connect_timeout: UDP_CONNECT_TIMEOUT,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl UdpConfig {
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

    /// Set the control packet retransmission schedule.
    pub fn with_retransmission(mut self, delay: Duration, retries: u32) -> Self {
        self.retransmission_delay = delay;
        self.retries = retries;
        self
    }

    /// Set the recommended connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn session_timing(&self) -> RetryConfig {
        RetryConfig::default().with_schedule(self.retransmission_delay, self.retries)
    }
}

enum DemuxCommand {
    Register(Arc<UdpSession>),
    Shutdown,
}

/// Bound socket plus the handle of its demultiplexer.
struct Endpoint {
    local: SocketAddr,
    sender: PacketSender,
    commands: mpsc::UnboundedSender<DemuxCommand>,
    reaper: mpsc::UnboundedSender<SessionId>,
    task: JoinHandle<()>,
}

/// Shared with the demultiplexer task.
struct DemuxContext {
    accepting: Arc<AtomicBool>,
    timing: RetryConfig,
    incoming: mpsc::UnboundedSender<NetStream>,
    errors: Arc<ErrorSink>,
}

/// Direct UDP transport.
pub struct UdpTransport {
    config: UdpConfig,
    endpoint: Mutex<Option<Endpoint>>,
    accepting: Arc<AtomicBool>,
    incoming: EventChannel<NetStream>,
    errors: Arc<ErrorSink>,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("config", &self.config)
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(UdpConfig::default())
    }
}

impl UdpTransport {
    /// Create an unbound transport; the socket is bound lazily.
    pub fn new(config: UdpConfig) -> Self {
        Self {
            config,
            endpoint: Mutex::new(None),
            accepting: Arc::new(AtomicBool::new(false)),
            incoming: EventChannel::new(),
            errors: Arc::new(ErrorSink::new(TRANSPORT_UDP)),
        }
    }

    /// Transport configuration.
    pub fn config(&self) -> &UdpConfig {
        &self.config
    }

    /// Local address of the bound socket, if any.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.lock().await.as_ref().map(|e| e.local)
    }

    async fn bind(&self, addr: SocketAddr) -> NetResult<Endpoint> {
        let socket = DatagramSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        let sender = socket.sender();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (reaper, reaped) = mpsc::unbounded_channel();
        let context = DemuxContext {
            accepting: Arc::clone(&self.accepting),
            timing: self.config.session_timing(),
            incoming: self.incoming.sender(),
            errors: Arc::clone(&self.errors),
        };
        let task = tokio::spawn(demux(socket, command_rx, reaped, reaper.clone(), context));
        tracing::debug!(local = %local, "udp socket bound");
        Ok(Endpoint {
            local,
            sender,
            commands,
            reaper,
            task,
        })
    }

    fn advertised(&self, local: SocketAddr) -> Vec<ConnectionDescriptor> {
        let addresses = if self.config.local_addresses.is_empty() {
            let ip = if local.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                local.ip()
            };
            vec![ip]
        } else {
            self.config.local_addresses.clone()
        };
        addresses
            .into_iter()
            .map(|ip| {
                let mut descriptor = ConnectionDescriptor::udp(SocketInfo::from(SocketAddr::new(
                    ip,
                    local.port(),
                )));
                descriptor.version = self.config.version.clone();
                descriptor
            })
            .collect()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.get_mut().take() {
            endpoint.task.abort();
        }
    }
}

/// Aborts the handshake of a connect future that gets dropped.
struct HandshakeGuard(Option<Arc<UdpSession>>);

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            if session.state() == SessionState::Connecting {
                let _ = session.abort_handshake();
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn transport_type(&self) -> &str {
        TRANSPORT_UDP
    }

    fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    async fn listen(
        &self,
        requested: Option<&ConnectionDescriptor>,
    ) -> NetResult<Vec<ConnectionDescriptor>> {
        let requested = requested
            .map(|d| d.socket_addr(TRANSPORT_UDP))
            .transpose()?;

        let mut endpoint = self.endpoint.lock().await;
        let bound = endpoint.as_ref().map(|e| e.local);
        let local = match (bound, requested) {
            (Some(local), Some(addr)) if local != addr => {
                return Err(NetError::InvalidState(format!(
                    "already bound to {local}, cannot listen on {addr}"
                )));
            }
            (Some(local), _) => local,
            (None, requested) => {
                let addr = requested
                    .or(self.config.bind_addr)
                    .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
                let bound = self.bind(addr).await?;
                let local = bound.local;
                *endpoint = Some(bound);
                local
            }
        };
        self.accepting.store(true, Ordering::SeqCst);

        let descriptors = self.advertised(local);
        tracing::info!(local = %local, count = descriptors.len(), "udp transport listening");
        Ok(descriptors)
    }

    async fn connect(&self, peer: &ConnectionDescriptor) -> NetResult<NetStream> {
        let addr = peer.socket_addr(TRANSPORT_UDP)?;

        let (sender, commands, reaper) = {
            let mut endpoint = self.endpoint.lock().await;
            if endpoint.is_none() {
                let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
                *endpoint = Some(self.bind(self.config.bind_addr.unwrap_or(any)).await?);
            }
            let bound = endpoint
                .as_ref()
                .ok_or_else(|| NetError::InvalidState("udp socket not bound".into()))?;
            (
                bound.sender.clone(),
                bound.commands.clone(),
                bound.reaper.clone(),
            )
        };

        let session = Arc::new(UdpSession::new(
            SessionId::generate(),
            addr,
            sender,
            self.config.session_timing(),
            reaper,
        ));
        commands
            .send(DemuxCommand::Register(Arc::clone(&session)))
            .map_err(|_| NetError::Closed)?;

        let mut guard = HandshakeGuard(Some(Arc::clone(&session)));
        session.init_handshake().await?;
        guard.0 = None;

        let events = session
            .take_events()
            .ok_or_else(|| NetError::InvalidState("session events already taken".into()))?;
        tracing::info!(peer = %addr, session = %session.id(), "udp session established");
        Ok(NetStream::spawn(session, events, peer.clone()))
    }

    async fn close(&self) -> NetResult<()> {
        self.accepting.store(false, Ordering::SeqCst);
        if let Some(endpoint) = self.endpoint.lock().await.take() {
            let _ = endpoint.commands.send(DemuxCommand::Shutdown);
            if let Err(e) = endpoint.task.await {
                tracing::debug!(error = %e, "udp demultiplexer ended abnormally");
            }
            tracing::info!(local = %endpoint.local, "udp transport closed");
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

async fn demux(
    mut socket: DatagramSocket,
    mut commands: mpsc::UnboundedReceiver<DemuxCommand>,
    mut reaped: mpsc::UnboundedReceiver<SessionId>,
    reaper: mpsc::UnboundedSender<SessionId>,
    context: DemuxContext,
) {
    let sender = socket.sender();
    let mut sessions: HashMap<SessionId, Arc<UdpSession>> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(DemuxCommand::Register(session)) => {
                    sessions.insert(session.id().clone(), session);
                }
                Some(DemuxCommand::Shutdown) | None => break,
            },
            Some(id) = reaped.recv() => {
                if sessions.remove(&id).is_some() {
                    tracing::trace!(session = %id, "session removed");
                }
            }
            received = socket.recv_from() => {
                let (bytes, from) = match received {
                    Ok(received) => received,
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        context.errors.report(NetError::Io(e));
                        break;
                    }
                };
                let packet = match Packet::decode(bytes) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::debug!(from = %from, error = %e, "dropping malformed datagram");
                        continue;
                    }
                };
                match sessions.get(&packet.session_id) {
                    Some(session) if session.peer() == from => session.process_packet(packet),
                    Some(_) => {
                        tracing::warn!(from = %from, session = %packet.session_id, "datagram from unexpected address");
                    }
                    None => {
                        if let Some(session) = unmatched(&context, &sender, &reaper, packet, from) {
                            sessions.insert(session.id().clone(), session);
                        }
                    }
                }
            }
        }
    }

    for (_, session) in sessions.drain() {
        session.terminate();
    }
}

/// Handle a packet for no known session.
///
/// Returns a new responder session for an accepted SYN.
fn unmatched(
    context: &DemuxContext,
    sender: &PacketSender,
    reaper: &mpsc::UnboundedSender<SessionId>,
    packet: Packet,
    from: SocketAddr,
) -> Option<Arc<UdpSession>> {
    match packet.kind {
        MessageType::Syn if context.accepting.load(Ordering::SeqCst) => {
            let session = Arc::new(UdpSession::new(
                packet.session_id.clone(),
                from,
                sender.clone(),
                context.timing,
                reaper.clone(),
            ));
            tokio::spawn(accept(
                Arc::clone(&session),
                packet,
                context.incoming.clone(),
            ));
            Some(session)
        }
        // The peer lost our ACK after we already forgot the session.
        MessageType::Fin | MessageType::Rst => {
            if let Some(tid) = packet.transaction_id() {
                let ack = Packet::control(MessageType::Ack, packet.session_id, &tid);
                let _ = sender.try_send(&ack, from);
            }
            None
        }
        kind => {
            tracing::debug!(from = %from, ?kind, session = %packet.session_id, "dropping packet for unknown session");
            None
        }
    }
}

async fn accept(
    session: Arc<UdpSession>,
    syn: Packet,
    incoming: mpsc::UnboundedSender<NetStream>,
) {
    if let Err(e) = session.respond(&syn).await {
        tracing::debug!(session = %session.id(), peer = %session.peer(), error = %e, "inbound handshake failed");
        return;
    }
    let Some(events) = session.take_events() else {
        return;
    };
    let mut peer = ConnectionDescriptor::udp(SocketInfo::from(session.peer()));
    peer.version = syn.version;
    tracing::info!(peer = %peer, session = %session.id(), "udp session accepted");
    if incoming
        .send(NetStream::spawn(session.clone(), events, peer))
        .is_err()
    {
        tracing::debug!(session = %session.id(), "no listener for inbound stream");
    }
}
