//! Rendezvous handshake over an established byte stream.
//!
//! A proxy stream wraps any reliable duplex (a TCP socket, an in-memory
//! pipe) in netstring-framed session packets. The initiator sends PING
//! through the retry primitive until it sees PONG (or DATA, if the peer is
//! already talking); the responder waits for the first PING before it
//! considers the stream usable. DATA seen by the responder ahead of any
//! PING fails the stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::packet::{read_frame, write_frame, MessageType, Packet};
use super::retry::{RetryConfig, RetryManager};
use super::stream::{NetStream, StreamBackend, StreamEvent};
use crate::core::{ConnectionDescriptor, NetError, NetResult, SessionId, TransactionId};

/// Byte stream a proxy stream can run over.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type SharedWriter<T> = Arc<Mutex<WriteHalf<T>>>;

enum Role {
    Initiator {
        ping: TransactionId,
    },
    Responder {
        ready: Option<oneshot::Sender<NetResult<()>>>,
    },
}

impl Role {
    fn fail(&mut self, retry: &RetryManager, err: NetError) {
        match self {
            Role::Initiator { ping } => {
                retry.abort(ping.as_str());
            }
            Role::Responder { ready } => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(err));
                }
            }
        }
    }
}

/// Open the initiator side of a proxy stream over `raw`.
///
/// Resolves once the peer answered PING, or fails when `handshake`'s retry
/// budget runs out.
pub async fn connect<T: RawStream>(
    raw: T,
    peer: ConnectionDescriptor,
    handshake: RetryConfig,
) -> NetResult<NetStream> {
    let id = SessionId::generate();
    let ping = TransactionId::generate();
    let retry = RetryManager::new(handshake);
    let (reader, writer) = tokio::io::split(raw);
    let writer: SharedWriter<T> = Arc::new(Mutex::new(writer));
    let (events, event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(read_loop(
        reader,
        Arc::clone(&writer),
        id.clone(),
        Role::Initiator { ping: ping.clone() },
        events,
        retry.clone(),
    ));

    let ping_packet = Packet::control(MessageType::Ping, id.clone(), &ping);
    let result = retry
        .execute_until_confirmed(ping.as_str(), || {
            let writer = Arc::clone(&writer);
            let ping_packet = ping_packet.clone();
            async move { write_frame(&mut *writer.lock().await, &ping_packet).await }
        })
        .await;

    if let Err(e) = result {
        task.abort();
        let _ = writer.lock().await.shutdown().await;
        return Err(e);
    }
    tracing::debug!(peer = %peer, stream = %id, "proxy stream ready");
    let backend = ProxyBackend {
        id,
        writer,
        reader: task,
    };
    Ok(NetStream::spawn(Arc::new(backend), event_rx, peer))
}

/// Open the responder side of a proxy stream over `raw`.
///
/// Waits up to `handshake`'s retry budget for the first PING.
pub async fn accept<T: RawStream>(
    raw: T,
    peer: ConnectionDescriptor,
    handshake: RetryConfig,
) -> NetResult<NetStream> {
    let id = SessionId::generate();
    let (reader, writer) = tokio::io::split(raw);
    let writer: SharedWriter<T> = Arc::new(Mutex::new(writer));
    let (events, event_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    let task = tokio::spawn(read_loop(
        reader,
        Arc::clone(&writer),
        id.clone(),
        Role::Responder {
            ready: Some(ready_tx),
        },
        events,
        RetryManager::default(),
    ));

    let ready = match tokio::time::timeout(handshake.budget(), ready_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(NetError::Closed),
        Err(_) => Err(NetError::RetriesExhausted),
    };
    if let Err(e) = ready {
        task.abort();
        let _ = writer.lock().await.shutdown().await;
        return Err(e);
    }
    tracing::debug!(peer = %peer, stream = %id, "proxy stream accepted");
    let backend = ProxyBackend {
        id,
        writer,
        reader: task,
    };
    Ok(NetStream::spawn(Arc::new(backend), event_rx, peer))
}

async fn read_loop<T: RawStream>(
    mut reader: ReadHalf<T>,
    writer: SharedWriter<T>,
    id: SessionId,
    mut role: Role,
    events: mpsc::UnboundedSender<StreamEvent>,
    retry: RetryManager,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                role.fail(&retry, NetError::Closed);
                let _ = events.send(StreamEvent::End);
                return;
            }
            Err(e) => {
                tracing::warn!(stream = %id, error = %e, "proxy stream read failed");
                role.fail(&retry, e);
                let _ = events.send(StreamEvent::Close);
                return;
            }
        };
        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(stream = %id, error = %e, "dropping malformed frame");
                continue;
            }
        };

        match packet.kind {
            MessageType::Ping => {
                let Some(tid) = packet.transaction_id() else {
                    continue;
                };
                let pong = Packet::control(MessageType::Pong, id.clone(), &tid);
                if let Err(e) = write_frame(&mut *writer.lock().await, &pong).await {
                    tracing::debug!(stream = %id, error = %e, "failed to answer PING");
                }
                if let Role::Responder { ready } = &mut role {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                }
            }
            MessageType::Pong => {
                if let Some(tid) = packet.transaction_id() {
                    retry.confirm(tid.as_str());
                }
            }
            MessageType::Data => match &mut role {
                Role::Responder { ready: Some(_) } => {
                    tracing::warn!(stream = %id, "DATA before PING");
                    role.fail(
                        &retry,
                        NetError::ProtocolViolation("DATA received before PING".into()),
                    );
                    return;
                }
                Role::Initiator { ping } => {
                    retry.confirm(ping.as_str());
                    let _ = events.send(StreamEvent::Data(packet.payload));
                }
                Role::Responder { ready: None } => {
                    let _ = events.send(StreamEvent::Data(packet.payload));
                }
            },
            MessageType::Rst => {
                tracing::debug!(stream = %id, "proxy stream reset by peer");
                role.fail(&retry, NetError::Closed);
                let _ = events.send(StreamEvent::Close);
                return;
            }
            kind => {
                tracing::debug!(stream = %id, ?kind, "dropping unexpected packet");
            }
        }
    }
}

struct ProxyBackend<T: RawStream> {
    id: SessionId,
    writer: SharedWriter<T>,
    reader: JoinHandle<()>,
}

impl<T: RawStream> Drop for ProxyBackend<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl<T: RawStream> StreamBackend for ProxyBackend<T> {
    async fn write(&self, data: Vec<u8>) -> NetResult<()> {
        let packet = Packet::data(self.id.clone(), data);
        write_frame(&mut *self.writer.lock().await, &packet).await
    }

    async fn end(&self) -> NetResult<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    async fn destroy(&self) -> NetResult<()> {
        let rst = Packet::control(MessageType::Rst, self.id.clone(), &TransactionId::generate());
        let mut writer = self.writer.lock().await;
        let sent = write_frame(&mut *writer, &rst).await;
        let _ = writer.shutdown().await;
        self.reader.abort();
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SocketInfo;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn peer() -> ConnectionDescriptor {
        ConnectionDescriptor::tcp(SocketInfo::new("127.0.0.1", 7))
    }

    fn quick() -> RetryConfig {
        RetryConfig::default().with_schedule(Duration::from_millis(20), 5)
    }

    #[tokio::test]
    async fn test_handshake_and_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let (client, server) = tokio::join!(
            connect(a, peer(), quick()),
            accept(b, peer(), quick())
        );
        let (mut client, mut server) = (client.unwrap(), server.unwrap());

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello");

        server.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn test_responder_rejects_data_before_ping() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(accept(b, peer(), quick()));

        let data = Packet::data(SessionId::from("x"), b"too early".to_vec());
        write_frame(&mut raw, &data).await.unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, NetError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_initiator_confirms_on_data() {
        let (a, mut raw) = tokio::io::duplex(4096);
        let client = tokio::spawn(connect(a, peer(), quick()));

        // Swallow the PING, answer with data instead of PONG.
        let ping = read_frame(&mut raw).await.unwrap().unwrap();
        assert_eq!(Packet::decode(&ping).unwrap().kind, MessageType::Ping);
        let data = Packet::data(SessionId::from("x"), b"eager".to_vec());
        write_frame(&mut raw, &data).await.unwrap();

        let mut client = client.await.unwrap().unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"eager");
    }

    #[tokio::test]
    async fn test_responder_answers_every_ping() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let server = tokio::spawn(accept(b, peer(), quick()));

        for tid in ["t1", "t2"] {
            let ping = Packet::control(MessageType::Ping, SessionId::from("x"), &tid.into());
            write_frame(&mut raw, &ping).await.unwrap();
            let pong = Packet::decode(&read_frame(&mut raw).await.unwrap().unwrap()).unwrap();
            assert_eq!(pong.kind, MessageType::Pong);
            assert_eq!(pong.transaction_id(), Some(TransactionId::from(tid)));
        }
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_gives_up_without_peer() {
        let (a, _silent): (DuplexStream, DuplexStream) = tokio::io::duplex(4096);
        let err = connect(a, peer(), quick()).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_destroy_closes_peer() {
        let (a, b) = tokio::io::duplex(4096);
        let (client, server) = tokio::join!(
            connect(a, peer(), quick()),
            accept(b, peer(), quick())
        );
        let (client, mut server) = (client.unwrap(), server.unwrap());

        client.destroy().await.unwrap();
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());
    }
}
