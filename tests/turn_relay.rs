//! TURN relay end to end through the net façade, over the in-process relay.

use std::sync::Arc;
use std::time::Duration;

use onetp::core::SocketInfo;
use onetp::prelude::*;
use onetp::transport::turn::TurnRequestKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct Peers {
    relay: LoopbackTurnServer,
    signaling: LocalSignaling,
}

impl Peers {
    fn new() -> Self {
        Self {
            relay: LoopbackTurnServer::new(Some(Duration::from_secs(600))),
            signaling: LocalSignaling::new(),
        }
    }

    fn transport(&self, config: TurnConfig) -> Arc<dyn Transport> {
        Arc::new(TurnTransport::new(
            config,
            Arc::new(self.signaling.clone()),
            Arc::new(self.relay.client()),
        ))
    }
}

/// Route library logs to the test harness; `RUST_LOG=onetp=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn relayed_stream_through_facade() {
    init_tracing();
    let peers = Peers::new();
    let server = create_server(vec![peers.transport(TurnConfig::default())]);
    let descriptors = server.listen(None).await.unwrap();
    assert_eq!(descriptors.len(), 1);
    assert!(descriptors[0].is_turn());

    let transports = vec![peers.transport(TurnConfig::default())];
    let mut client = create_connection(&descriptors, &transports, &ConnectConfig::default())
        .await
        .unwrap();
    client.write_all(b"hello through the relay").await.unwrap();

    let mut inbound = server.accept().await.unwrap();
    let mut buf = [0u8; 23];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the relay");

    inbound.write_all(b"hello back").await.unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello back");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    inbound.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.close().await.unwrap();
    assert_eq!(peers.relay.allocations(), 1);
}

#[tokio::test]
async fn relayed_stream_with_channels() {
    let peers = Peers::new();
    let config = TurnConfig::default().with_channels(true);
    let server = create_server(vec![peers.transport(config.clone())]);
    let descriptors = server.listen(None).await.unwrap();

    let transports = vec![peers.transport(config)];
    let mut client = create_connection(&descriptors, &transports, &ConnectConfig::default())
        .await
        .unwrap();
    client.write_all(b"chan").await.unwrap();

    let mut inbound = server.accept().await.unwrap();
    let mut buf = [0u8; 4];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"chan");
    assert_eq!(peers.relay.requests_of(TurnRequestKind::Channel).len(), 2);
}

#[tokio::test]
async fn destroy_closes_the_relayed_peer() {
    let peers = Peers::new();
    let server = create_server(vec![peers.transport(TurnConfig::default())]);
    let descriptors = server.listen(None).await.unwrap();
    let transports = vec![peers.transport(TurnConfig::default())];
    let mut client = create_connection(&descriptors, &transports, &ConnectConfig::default())
        .await
        .unwrap();
    client.write_all(b"x").await.unwrap();

    let mut inbound = server.accept().await.unwrap();
    let mut buf = [0u8; 1];
    inbound.read_exact(&mut buf).await.unwrap();

    client.destroy().await.unwrap();
    let mut rest = Vec::new();
    let _ = inbound.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn mixed_descriptors_race_to_the_relay() {
    let peers = Peers::new();
    let server = create_server(vec![peers.transport(TurnConfig::default())]);
    let mut descriptors = vec![ConnectionDescriptor::udp(SocketInfo::new("127.0.0.1", 9))];
    descriptors.extend(server.listen(None).await.unwrap());

    let transports: Vec<Arc<dyn Transport>> = vec![
        Arc::new(UdpTransport::new(
            UdpConfig::default().with_connect_timeout(Duration::from_millis(300)),
        )),
        peers.transport(TurnConfig::default()),
    ];
    let config = ConnectConfig::default().with_policy(SchedulePolicy::Parallel);
    let client = create_connection(&descriptors, &transports, &config)
        .await
        .unwrap();
    assert!(client.peer().is_turn());
}

#[tokio::test(start_paused = true)]
async fn refresh_failure_reaches_error_channel() {
    let peers = Peers::new();
    let responder = peers.transport(TurnConfig::default());
    let descriptors = responder.listen(None).await.unwrap();

    let initiator = peers.transport(TurnConfig::default());
    let mut errors = initiator.take_errors().unwrap();
    let _stream = initiator.connect(&descriptors[0]).await.unwrap();

    peers.relay.set_failing(TurnRequestKind::Permission, true);
    let err = errors.recv().await.unwrap();
    assert!(matches!(err, NetError::Relay(ref reason) if reason.contains("permission")));
}
