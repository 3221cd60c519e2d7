//! TURN relay transport.
//!
//! Both peers hold a relay allocation on a TURN server and meet through a
//! signaling service:
//!
//! ```text
//! initiator                     signaling                     responder
//!     | allocate                                                  |
//!     |------ connect {relay_address, srflx_address} ------------>|
//!     |                                         allocate          |
//!     |                                         create_permission |
//!     |<----- ready {relay_address, srflx_address} ---------------|
//!     | create_permission                                         |
//!     |================ prefixed datagrams via relays =============|
//! ```
//!
//! The connect message is retransmitted until the matching ready arrives.
//! Allocation, permissions and channel bindings are refreshed in the
//! background for as long as they are in use; a failed refresh is
//! reported on the transport's error channel.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::client::{Allocation, TurnClient};
use super::message::{OperationType, RendezvousMessage};
use super::relay::{receive_loop, RelayBackend, RelayEntry, RelayTable};
use crate::core::constants::{
    PROTOCOL_VERSION, TRANSPORT_TURN_UDP, TURN_CHANNEL_LIFETIME, TURN_CONNECT_TIMEOUT,
    TURN_DEFAULT_ALLOCATION_LIFETIME, TURN_PERMISSION_LIFETIME, TURN_REFRESH_MARGIN,
};
use crate::core::{
    ConnectionDescriptor, ErrorSink, EventChannel, NetError, NetResult, SignalingRegistration,
    Transport,
};
use crate::signaling::{Registration, Signaling};
use crate::transport::retry::{RetryConfig, RetryManager};
use crate::transport::stream::NetStream;

/// TURN transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Tag of this transport, `turn-udp` or `turn-tcp` depending on how the
    /// client reaches its server.
    pub transport_type: String,
    /// Refresh this long before a lease expires.
    pub refresh_margin: Duration,
    /// Lifetime requested when the server did not report one.
    pub default_allocation_lifetime: Duration,
    /// Permission lifetime.
    pub permission_lifetime: Duration,
    /// Channel binding lifetime.
    pub channel_lifetime: Duration,
    /// Bind a channel to every peer on top of its permission.
    pub use_channels: bool,
    /// Recommended per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Retransmission of the `connect` rendezvous message.
    pub rendezvous: RetryConfig,
    /// Version advertised in descriptors and rendezvous messages.
    pub version: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            transport_type: TRANSPORT_TURN_UDP.to_string(),
            refresh_margin: TURN_REFRESH_MARGIN,
            default_allocation_lifetime: TURN_DEFAULT_ALLOCATION_LIFETIME,
            permission_lifetime: TURN_PERMISSION_LIFETIME,
            channel_lifetime: TURN_CHANNEL_LIFETIME,
            use_channels: false,
            connect_timeout: TURN_CONNECT_TIMEOUT,
            rendezvous: RetryConfig::default(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl TurnConfig {
    /// Use another transport tag.
    pub fn with_transport_type(mut self, transport_type: impl Into<String>) -> Self {
        self.transport_type = transport_type.into();
        self
    }

    /// Bind channels to peers.
    pub fn with_channels(mut self, enabled: bool) -> Self {
        self.use_channels = enabled;
        self
    }

    /// Set the refresh margin.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Set the rendezvous retransmission schedule.
    pub fn with_rendezvous(mut self, rendezvous: RetryConfig) -> Self {
        self.rendezvous = rendezvous;
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Delay between two refreshes of a lease of `lifetime`.
///
/// Falls back to half the lifetime when the margin would leave nothing.
pub fn refresh_interval(lifetime: Duration, margin: Duration) -> Duration {
    match lifetime.checked_sub(margin) {
        Some(interval) if !interval.is_zero() => interval,
        _ => lifetime / 2,
    }
}

/// Transport relaying every stream through a TURN server.
pub struct TurnTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TurnConfig,
    signaling: Arc<dyn Signaling>,
    client: Arc<dyn TurnClient>,
    accepting: AtomicBool,
    registration: tokio::sync::Mutex<Option<SignalingRegistration>>,
    allocation: tokio::sync::Mutex<Option<Allocation>>,
    relays: Arc<RelayTable>,
    /// Outstanding connects, keyed by the responder's uid and tagged with
    /// the attempt that registered them.
    pending: Mutex<HashMap<String, (u64, oneshot::Sender<RendezvousMessage>)>>,
    attempts: AtomicU64,
    /// Inbound connects being answered, keyed by the initiator's uid.
    answering: Mutex<HashSet<String>>,
    retry: RetryManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    incoming: EventChannel<NetStream>,
    errors: Arc<ErrorSink>,
}

impl std::fmt::Debug for TurnTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnTransport")
            .field("config", &self.inner.config)
            .field("signaling", &self.inner.signaling.kind())
            .field("accepting", &self.inner.accepting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TurnTransport {
    /// Create a transport using `signaling` for the rendezvous and `client`
    /// for the relay allocation.
    pub fn new(
        config: TurnConfig,
        signaling: Arc<dyn Signaling>,
        client: Arc<dyn TurnClient>,
    ) -> Self {
        let retry = RetryManager::new(config.rendezvous);
        Self {
            inner: Arc::new(Inner {
                config,
                signaling,
                client,
                accepting: AtomicBool::new(false),
                registration: tokio::sync::Mutex::new(None),
                allocation: tokio::sync::Mutex::new(None),
                relays: Arc::new(RelayTable::default()),
                pending: Mutex::new(HashMap::new()),
                attempts: AtomicU64::new(0),
                answering: Mutex::new(HashSet::new()),
                retry,
                tasks: Mutex::new(Vec::new()),
                incoming: EventChannel::new(),
                errors: Arc::new(ErrorSink::new("turn")),
            }),
        }
    }

    /// Transport configuration.
    pub fn config(&self) -> &TurnConfig {
        &self.inner.config
    }

    /// Current allocation, if one was made.
    pub async fn allocation(&self) -> Option<Allocation> {
        *self.inner.allocation.lock().await
    }
}

impl Drop for TurnTransport {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

/// Removes an outstanding connect when its caller goes away.
struct PendingConnect<'a> {
    inner: &'a Inner,
    uid: String,
    attempt: u64,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let mut pending = lock(&self.inner.pending);
        if pending.get(&self.uid).is_some_and(|(attempt, _)| *attempt == self.attempt) {
            pending.remove(&self.uid);
        }
    }
}

impl Inner {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Abort background work and close every relayed stream.
    fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let uids: Vec<String> = lock(&self.pending).drain().map(|(uid, _)| uid).collect();
        for uid in uids {
            self.retry.abort(&uid);
        }
        self.relays.clear();
    }

    async fn ensure_registered(self: &Arc<Self>) -> NetResult<SignalingRegistration> {
        let mut registration = self.registration.lock().await;
        if let Some(existing) = registration.as_ref() {
            return Ok(existing.clone());
        }
        let Registration {
            descriptor,
            messages,
        } = self.signaling.register().await?;
        tracing::debug!(uid = %descriptor.uid, kind = %descriptor.kind, "turn transport registered");
        self.track(tokio::spawn(dispatch(Arc::clone(self), messages)));
        *registration = Some(descriptor.clone());
        Ok(descriptor)
    }

    async fn ensure_allocation(&self) -> NetResult<Allocation> {
        let mut allocation = self.allocation.lock().await;
        if let Some(existing) = *allocation {
            return Ok(existing);
        }
        let granted = self.client.allocate().await?;
        tracing::info!(
            relayed = %granted.relayed,
            mapped = %granted.mapped,
            lifetime = ?granted.lifetime,
            "turn allocation created"
        );

        let datagrams = self
            .client
            .take_receiver()
            .ok_or_else(|| NetError::InvalidState("relay receiver already taken".into()))?;
        self.track(tokio::spawn(receive_loop(datagrams, Arc::clone(&self.relays))));
        self.track(tokio::spawn(refresh_allocation(
            Arc::clone(&self.client),
            Arc::clone(&self.errors),
            granted.lifetime,
            self.config.default_allocation_lifetime,
            self.config.refresh_margin,
        )));

        *allocation = Some(granted);
        Ok(granted)
    }

    /// Install the permission (and channel) for `peer_relay` and open the
    /// stream backed by it.
    async fn open_relay(
        &self,
        peer_relay: SocketAddr,
        descriptor: ConnectionDescriptor,
    ) -> NetResult<NetStream> {
        if self.relays.contains(&peer_relay) {
            return Err(NetError::InvalidState(format!(
                "relayed stream to {peer_relay} is already open"
            )));
        }
        self.client.create_permission(peer_relay).await?;
        let margin = self.config.refresh_margin;
        let mut loops = vec![tokio::spawn(refresh_permission(
            Arc::clone(&self.client),
            Arc::clone(&self.errors),
            peer_relay,
            refresh_interval(self.config.permission_lifetime, margin),
        ))];
        if self.config.use_channels {
            let channel = match self.client.bind_channel(peer_relay).await {
                Ok(channel) => channel,
                Err(e) => {
                    for task in &loops {
                        task.abort();
                    }
                    return Err(e);
                }
            };
            tracing::debug!(peer = %peer_relay, channel, "turn channel bound");
            loops.push(tokio::spawn(refresh_channel(
                Arc::clone(&self.client),
                Arc::clone(&self.errors),
                peer_relay,
                refresh_interval(self.config.channel_lifetime, margin),
            )));
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        self.relays
            .insert(peer_relay, RelayEntry::new(events, loops))?;
        let backend = RelayBackend {
            peer: peer_relay,
            client: Arc::clone(&self.client),
            table: Arc::clone(&self.relays),
        };
        tracing::info!(peer = %peer_relay, "turn relay established");
        Ok(NetStream::spawn(Arc::new(backend), events_rx, descriptor))
    }

    async fn own_message(&self, operation: OperationType) -> NetResult<RendezvousMessage> {
        let sender = self
            .registration
            .lock()
            .await
            .clone()
            .ok_or_else(|| NetError::InvalidState("not registered with signaling".into()))?;
        let allocation = self.ensure_allocation().await?;
        Ok(RendezvousMessage::new(
            operation,
            self.config.version.clone(),
            sender,
            allocation.mapped,
            allocation.relayed,
        ))
    }

    async fn reply_ready(&self, destination: &SignalingRegistration) -> NetResult<()> {
        let ready = self.own_message(OperationType::Ready).await?.to_value()?;
        self.signaling.send(ready, destination).await
    }

    fn on_ready(&self, message: RendezvousMessage) {
        let uid = message.sender.uid.clone();
        match lock(&self.pending).remove(&uid) {
            Some((_, waiter)) => {
                let _ = waiter.send(message);
                self.retry.confirm(&uid);
            }
            None => tracing::debug!(uid = %uid, "ready without a pending connect"),
        }
    }

    async fn on_connect(&self, message: RendezvousMessage) {
        if !self.accepting.load(Ordering::SeqCst) {
            tracing::debug!(uid = %message.sender.uid, "not accepting, ignoring connect");
            return;
        }
        let peer_relay = match message.relay_address() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(uid = %message.sender.uid, error = %e, "connect with a bad relay address");
                return;
            }
        };

        // A retransmitted connect whose ready got lost.
        if self.relays.contains(&peer_relay) {
            if let Err(e) = self.reply_ready(&message.sender).await {
                tracing::debug!(uid = %message.sender.uid, error = %e, "ready resend failed");
            }
            return;
        }

        let uid = message.sender.uid.clone();
        if !lock(&self.answering).insert(uid.clone()) {
            return;
        }
        let answered = self.answer(&message, peer_relay).await;
        lock(&self.answering).remove(&uid);
        if let Err(e) = answered {
            tracing::warn!(uid = %uid, error = %e, "inbound turn rendezvous failed");
        }
    }

    async fn answer(&self, message: &RendezvousMessage, peer_relay: SocketAddr) -> NetResult<()> {
        self.ensure_allocation().await?;
        let mut descriptor =
            ConnectionDescriptor::turn(self.config.transport_type.clone(), message.sender.clone());
        descriptor.version = message.version.clone();
        let stream = self.open_relay(peer_relay, descriptor).await?;
        if self.incoming.sender().send(stream).is_err() {
            tracing::debug!(uid = %message.sender.uid, "incoming receiver dropped");
        }
        self.reply_ready(&message.sender).await
    }
}

/// Route signaling messages of our registration.
async fn dispatch(inner: Arc<Inner>, mut messages: mpsc::UnboundedReceiver<serde_json::Value>) {
    while let Some(value) = messages.recv().await {
        let message = match RendezvousMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed rendezvous message");
                continue;
            }
        };
        match message.operation_type {
            OperationType::Ready => inner.on_ready(message),
            OperationType::Connect => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { inner.on_connect(message).await });
            }
        }
    }
    tracing::debug!("signaling registration closed");
}

async fn refresh_allocation(
    client: Arc<dyn TurnClient>,
    errors: Arc<ErrorSink>,
    granted: Option<Duration>,
    default_lifetime: Duration,
    margin: Duration,
) {
    let mut lifetime = match granted {
        Some(lifetime) => lifetime,
        None => match client.refresh(default_lifetime).await {
            Ok(lifetime) => lifetime,
            Err(e) => {
                errors.report(relay_error("allocation refresh", e));
                return;
            }
        },
    };
    loop {
        tokio::time::sleep(refresh_interval(lifetime, margin)).await;
        match client.refresh(lifetime).await {
            Ok(renewed) => {
                tracing::trace!(lifetime = ?renewed, "turn allocation refreshed");
                lifetime = renewed;
            }
            Err(e) => {
                errors.report(relay_error("allocation refresh", e));
                return;
            }
        }
    }
}

async fn refresh_permission(
    client: Arc<dyn TurnClient>,
    errors: Arc<ErrorSink>,
    peer: SocketAddr,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = client.create_permission(peer).await {
            errors.report(relay_error("permission refresh", e));
            return;
        }
        tracing::trace!(peer = %peer, "turn permission refreshed");
    }
}

async fn refresh_channel(
    client: Arc<dyn TurnClient>,
    errors: Arc<ErrorSink>,
    peer: SocketAddr,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = client.bind_channel(peer).await {
            errors.report(relay_error("channel refresh", e));
            return;
        }
        tracing::trace!(peer = %peer, "turn channel refreshed");
    }
}

fn relay_error(what: &str, err: NetError) -> NetError {
    match err {
        NetError::Relay(reason) => NetError::Relay(format!("{what} failed: {reason}")),
        other => NetError::Relay(format!("{what} failed: {other}")),
    }
}

#[async_trait]
impl Transport for TurnTransport {
    fn transport_type(&self) -> &str {
        &self.inner.config.transport_type
    }

    fn connect_timeout(&self) -> Duration {
        self.inner.config.connect_timeout
    }

    async fn listen(
        &self,
        requested: Option<&ConnectionDescriptor>,
    ) -> NetResult<Vec<ConnectionDescriptor>> {
        let inner = &self.inner;
        if let Some(requested) = requested {
            requested.expect_type(&inner.config.transport_type)?;
        }
        let registration = inner.ensure_registered().await?;
        inner.accepting.store(true, Ordering::SeqCst);

        let mut descriptor =
            ConnectionDescriptor::turn(inner.config.transport_type.clone(), registration);
        descriptor.version = inner.config.version.clone();
        tracing::info!(descriptor = %descriptor, "turn transport listening");
        Ok(vec![descriptor])
    }

    async fn connect(&self, peer: &ConnectionDescriptor) -> NetResult<NetStream> {
        let inner = &self.inner;
        peer.expect_type(&inner.config.transport_type)?;
        let target = peer
            .registration()
            .ok_or_else(|| {
                NetError::InvalidArgument("turn descriptor without signaling registration".into())
            })?
            .clone();
        if target.kind != inner.signaling.kind() {
            return Err(NetError::InvalidArgument(format!(
                "cannot reach {} registration through {} signaling",
                target.kind,
                inner.signaling.kind()
            )));
        }

        inner.ensure_registered().await?;
        let offer = inner
            .own_message(OperationType::Connect)
            .await?
            .to_value()?;

        let (waiter, ready) = oneshot::channel();
        let attempt = inner.attempts.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = lock(&inner.pending);
            if pending.contains_key(&target.uid) {
                return Err(NetError::InvalidState(format!(
                    "connect to {} already in progress",
                    target.uid
                )));
            }
            pending.insert(target.uid.clone(), (attempt, waiter));
        }
        let _pending = PendingConnect {
            inner,
            uid: target.uid.clone(),
            attempt,
        };

        let signaling = Arc::clone(&inner.signaling);
        inner
            .retry
            .execute_until_confirmed(&target.uid, || {
                let signaling = Arc::clone(&signaling);
                let offer = offer.clone();
                let target = target.clone();
                async move { signaling.send(offer, &target).await }
            })
            .await?;

        let answer = ready.await.map_err(|_| NetError::Aborted)?;
        let peer_relay = answer.relay_address()?;
        tracing::debug!(uid = %target.uid, relay = %peer_relay, "turn rendezvous complete");
        inner.open_relay(peer_relay, peer.clone()).await
    }

    async fn close(&self) -> NetResult<()> {
        let inner = &self.inner;
        inner.stop();
        if inner.allocation.lock().await.take().is_some() {
            if let Err(e) = inner.client.close().await {
                tracing::debug!(error = %e, "turn allocation release failed");
            }
        }
        if let Some(registration) = inner.registration.lock().await.take() {
            inner.signaling.deregister(&registration).await?;
        }
        tracing::info!(transport = %inner.config.transport_type, "turn transport closed");
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<NetStream>> {
        self.inner.incoming.take()
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<NetError>> {
        self.inner.errors.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::LocalSignaling;
    use crate::transport::turn::{LoopbackTurnServer, TurnRequestKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn transport(
        server: &LoopbackTurnServer,
        signaling: &LocalSignaling,
        config: TurnConfig,
    ) -> TurnTransport {
        TurnTransport::new(
            config,
            Arc::new(signaling.clone()),
            Arc::new(server.client()),
        )
    }

    #[test]
    fn test_refresh_interval() {
        let margin = Duration::from_secs(10);
        assert_eq!(refresh_interval(Duration::from_secs(600), margin), Duration::from_secs(590));
        assert_eq!(refresh_interval(Duration::from_secs(10), margin), Duration::from_secs(5));
        assert_eq!(refresh_interval(Duration::from_secs(4), margin), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let server = LoopbackTurnServer::new(Some(Duration::from_secs(600)));
        let signaling = LocalSignaling::new();
        let a = transport(&server, &signaling, TurnConfig::default());
        let b = transport(&server, &signaling, TurnConfig::default());
        let mut incoming = b.take_incoming().unwrap();

        let descriptors = b.listen(None).await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].transport_type, TRANSPORT_TURN_UDP);

        let mut outbound = a.connect(&descriptors[0]).await.unwrap();
        let mut inbound = incoming.recv().await.unwrap();
        assert!(inbound.peer().is_turn());

        outbound.write_all(b"through the relay").await.unwrap();
        let mut buf = [0u8; 17];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the relay");

        inbound.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
        assert_eq!(server.allocations(), 2);
    }

    #[tokio::test]
    async fn test_second_connect_to_same_peer_keeps_first_stream() {
        let server = LoopbackTurnServer::new(Some(Duration::from_secs(600)));
        let signaling = LocalSignaling::new();
        let a = transport(&server, &signaling, TurnConfig::default());
        let b = transport(&server, &signaling, TurnConfig::default());
        let mut incoming = b.take_incoming().unwrap();
        let descriptors = b.listen(None).await.unwrap();

        let mut outbound = a.connect(&descriptors[0]).await.unwrap();
        let mut inbound = incoming.recv().await.unwrap();

        let err = a.connect(&descriptors[0]).await.unwrap_err();
        assert!(matches!(err, NetError::InvalidState(_)));
        assert!(incoming.try_recv().is_err());

        outbound.write_all(b"first").await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        inbound.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[tokio::test(start_paused = true)]
    async fn test_allocation_refresh_cadence() {
        let server = LoopbackTurnServer::new(Some(Duration::from_secs(30)));
        let signaling = LocalSignaling::new();
        let a = transport(&server, &signaling, TurnConfig::default());
        let b = transport(&server, &signaling, TurnConfig::default());
        let descriptors = b.listen(None).await.unwrap();
        let _stream = a.connect(&descriptors[0]).await.unwrap();

        let relayed = a.allocation().await.unwrap().relayed;
        let start = server.requests_of(TurnRequestKind::Allocate)[0].at;
        tokio::time::sleep(Duration::from_secs(45)).await;

        let offsets: Vec<Duration> = server
            .requests_of(TurnRequestKind::Refresh)
            .into_iter()
            .filter(|r| r.relayed == Some(relayed))
            .map(|r| r.at - start)
            .collect();
        assert_eq!(offsets, vec![Duration::from_secs(20), Duration::from_secs(40)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_lifetime_refreshes_immediately() {
        let server = LoopbackTurnServer::new(None);
        let signaling = LocalSignaling::new();
        let a = transport(&server, &signaling, TurnConfig::default());
        let b = transport(&server, &signaling, TurnConfig::default());
        let descriptors = b.listen(None).await.unwrap();
        let _stream = a.connect(&descriptors[0]).await.unwrap();
        tokio::task::yield_now().await;

        let relayed = a.allocation().await.unwrap().relayed;
        let allocated = server.requests_of(TurnRequestKind::Allocate)[0].at;
        let first = server
            .requests_of(TurnRequestKind::Refresh)
            .into_iter()
            .find(|r| r.relayed == Some(relayed))
            .unwrap();
        assert_eq!(first.at, allocated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_refresh_cadence() {
        let server = LoopbackTurnServer::new(Some(Duration::from_secs(600)));
        let signaling = LocalSignaling::new();
        let a = transport(&server, &signaling, TurnConfig::default().with_channels(true));
        let b = transport(&server, &signaling, TurnConfig::default());
        let descriptors = b.listen(None).await.unwrap();
        let _stream = a.connect(&descriptors[0]).await.unwrap();

        let relayed = a.allocation().await.unwrap().relayed;
        let start = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_secs(600)).await;

        let of = |kind| -> Vec<Duration> {
            server
                .requests_of(kind)
                .into_iter()
                .filter(|r| r.relayed == Some(relayed))
                .map(|r| r.at - start)
                .collect()
        };
        assert_eq!(
            of(TurnRequestKind::Permission),
            vec![Duration::ZERO, Duration::from_secs(290), Duration::from_secs(580)]
        );
        assert_eq!(
            of(TurnRequestKind::Channel),
            vec![Duration::ZERO, Duration::from_secs(590)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_surfaces_and_stops() {
        let server = LoopbackTurnServer::new(Some(Duration::from_secs(30)));
        let signaling = LocalSignaling::new();
        let a = transport(&server, &signaling, TurnConfig::default());
        let b = transport(&server, &signaling, TurnConfig::default());
        let mut errors = a.take_errors().unwrap();
        let descriptors = b.listen(None).await.unwrap();
        let _stream = a.connect(&descriptors[0]).await.unwrap();

        server.set_failing(TurnRequestKind::Refresh, true);
        let err = errors.recv().await.unwrap();
        assert!(matches!(err, NetError::Relay(_)));

        let relayed = a.allocation().await.unwrap().relayed;
        let count = || {
            server
                .requests_of(TurnRequestKind::Refresh)
                .into_iter()
                .filter(|r| r.relayed == Some(relayed))
                .count()
        };
        let seen = count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count(), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_when_not_accepting() {
        let server = LoopbackTurnServer::default();
        let signaling = LocalSignaling::new();
        let rendezvous = RetryConfig::default().with_schedule(Duration::from_millis(100), 2);
        let a = transport(
            &server,
            &signaling,
            TurnConfig::default().with_rendezvous(rendezvous),
        );
        let b = transport(&server, &signaling, TurnConfig::default());
        let descriptors = b.listen(None).await.unwrap();
        b.inner.accepting.store(false, Ordering::SeqCst);

        let err = a.connect(&descriptors[0]).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(lock(&a.inner.pending).is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_descriptors() {
        let server = LoopbackTurnServer::default();
        let signaling = LocalSignaling::new();
        let a = transport(&server, &signaling, TurnConfig::default());

        let udp = ConnectionDescriptor::udp(crate::core::SocketInfo::new("127.0.0.1", 1));
        assert!(a.connect(&udp).await.unwrap_err().is_argument_error());

        let foreign = ConnectionDescriptor::turn(
            TRANSPORT_TURN_UDP,
            SignalingRegistration {
                kind: "websocket".into(),
                uid: "x".into(),
                url: Some("ws://relay".into()),
            },
        );
        assert!(a.connect(&foreign).await.unwrap_err().is_argument_error());
        assert_eq!(server.allocations(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let server = LoopbackTurnServer::new(Some(Duration::from_secs(600)));
        let signaling = LocalSignaling::new();
        let a = transport(&server, &signaling, TurnConfig::default());
        let b = transport(&server, &signaling, TurnConfig::default());
        let descriptors = b.listen(None).await.unwrap();
        let mut stream = a.connect(&descriptors[0]).await.unwrap();

        a.close().await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(stream.read_to_end(&mut buf).await.unwrap_or(0), 0);
        assert_eq!(server.allocations(), 1);

        b.close().await.unwrap();
        assert_eq!(server.allocations(), 0);
        assert_eq!(signaling.registrations(), 0);
    }
}
