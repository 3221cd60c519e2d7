//! Relay-backed signaling over one WebSocket connection.
//!
//! Requests are JSON text frames tagged with a `requestId`; the relay
//! acknowledges each one with a `response` frame carrying an HTTP-like
//! status. Messages for our registrations arrive as pushed `message`
//! frames and are routed by destination uid.
//!
//! ```text
//! -> {"type":"register","requestId":1}
//! <- {"type":"response","requestId":1,"status":200,"uid":"a1b2"}
//! -> {"type":"send","requestId":2,"destination":"c3d4","message":{..}}
//! <- {"type":"response","requestId":2,"status":200}
//! <- {"type":"message","destination":"a1b2","message":{..}}
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{Registration, Signaling, SIGNALING_WEBSOCKET};
use crate::core::{NetError, NetResult, SignalingRegistration};

/// Default time to wait for the relay to acknowledge a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Status code the relay uses for success.
const STATUS_OK: u16 = 200;

/// WebSocket signaling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Relay server URL (`ws://` or `wss://`).
    pub url: String,
    /// Time to wait for each request's acknowledgement.
    pub request_timeout: Duration,
}

impl WebSocketConfig {
    /// Configuration for the relay at `url` with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Request {
    Register {
        #[serde(rename = "requestId")]
        request_id: u64,
    },
    Send {
        #[serde(rename = "requestId")]
        request_id: u64,
        destination: String,
        message: Value,
    },
    Deregister {
        #[serde(rename = "requestId")]
        request_id: u64,
        uid: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Inbound {
    Response {
        #[serde(rename = "requestId")]
        request_id: u64,
        status: u16,
        #[serde(default)]
        uid: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    Message {
        destination: String,
        message: Value,
    },
}

#[derive(Debug)]
struct Response {
    status: u16,
    uid: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Default)]
struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inboxes(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Value>>> {
        self.inboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<Inbound>(text) {
            Ok(Inbound::Response {
                request_id,
                status,
                uid,
                reason,
            }) => match self.pending().remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(Response {
                        status,
                        uid,
                        reason,
                    });
                }
                None => tracing::debug!(request_id, "response for unknown request"),
            },
            Ok(Inbound::Message {
                destination,
                message,
            }) => match self.inboxes().get(&destination) {
                Some(inbox) => {
                    let _ = inbox.send(message);
                }
                None => tracing::debug!(uid = %destination, "message for unknown registration"),
            },
            Err(e) => tracing::warn!(error = %e, "dropping malformed signaling frame"),
        }
    }
}

/// Removes a pending request when its waiter goes away.
struct PendingRequest<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

/// Signaling through a WebSocket relay server.
#[derive(Debug)]
pub struct WebSocketSignaling {
    config: WebSocketConfig,
    outbound: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl WebSocketSignaling {
    /// Connect to the relay server.
    pub async fn connect(config: WebSocketConfig) -> NetResult<Self> {
        let (socket, _) = tokio::time::timeout(
            config.request_timeout,
            tokio_tungstenite::connect_async(config.url.as_str()),
        )
        .await
        .map_err(|_| NetError::Signaling(format!("timed out connecting to {}", config.url)))?
        .map_err(|e| NetError::Signaling(format!("connect to {} failed: {e}", config.url)))?;
        tracing::info!(url = %config.url, "signaling relay connected");

        let shared = Arc::new(Shared::default());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(io_loop(socket, outbound_rx, Arc::clone(&shared)));
        Ok(Self {
            config,
            outbound,
            shared,
            task,
        })
    }

    /// Relay server URL.
    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn request(&self, build: impl FnOnce(u64) -> Request) -> NetResult<Response> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        let _pending = PendingRequest {
            shared: &self.shared,
            id,
        };

        let text = serde_json::to_string(&build(id))?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| NetError::Signaling("relay connection closed".into()))?;

        let response = tokio::time::timeout(self.config.request_timeout, rx)
            .await
            .map_err(|_| NetError::Signaling(format!("request {id} timed out")))?
            .map_err(|_| NetError::Signaling("relay connection closed".into()))?;
        if response.status != STATUS_OK {
            return Err(NetError::Signaling(format!(
                "relay rejected request {id} with status {}: {}",
                response.status,
                response.reason.as_deref().unwrap_or("no reason")
            )));
        }
        Ok(response)
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn io_loop<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        tracing::warn!(error = %e, "signaling send failed");
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => shared.dispatch(text),
                    Err(_) => tracing::warn!("dropping non-utf8 signaling frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("signaling relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "signaling receive failed");
                    break;
                }
            },
        }
    }
    // Fail every waiter and end every inbox.
    shared.pending().clear();
    shared.inboxes().clear();
}

#[async_trait]
impl Signaling for WebSocketSignaling {
    fn kind(&self) -> &str {
        SIGNALING_WEBSOCKET
    }

    async fn register(&self) -> NetResult<Registration> {
        let response = self
            .request(|request_id| Request::Register { request_id })
            .await?;
        let uid = response
            .uid
            .ok_or_else(|| NetError::Signaling("register response without uid".into()))?;
        let (tx, messages) = mpsc::unbounded_channel();
        self.shared.inboxes().insert(uid.clone(), tx);
        tracing::debug!(uid = %uid, url = %self.config.url, "websocket signaling registered");
        Ok(Registration {
            descriptor: SignalingRegistration {
                kind: SIGNALING_WEBSOCKET.to_string(),
                uid,
                url: Some(self.config.url.clone()),
            },
            messages,
        })
    }

    async fn send(&self, message: Value, destination: &SignalingRegistration) -> NetResult<()> {
        if destination.kind != SIGNALING_WEBSOCKET {
            return Err(NetError::InvalidArgument(format!(
                "websocket signaling cannot reach a {} registration",
                destination.kind
            )));
        }
        let uid = destination.uid.clone();
        self.request(|request_id| Request::Send {
            request_id,
            destination: uid,
            message,
        })
        .await?;
        Ok(())
    }

    async fn deregister(&self, registration: &SignalingRegistration) -> NetResult<()> {
        self.shared.inboxes().remove(&registration.uid);
        let uid = registration.uid.clone();
        self.request(|request_id| Request::Deregister { request_id, uid })
            .await?;
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        let uids: Vec<String> = self.shared.inboxes().keys().cloned().collect();
        for uid in uids {
            self.shared.inboxes().remove(&uid);
            let request = self
                .request(|request_id| Request::Deregister { request_id, uid })
                .await;
            if let Err(e) = request {
                tracing::debug!(error = %e, "deregister on close failed");
            }
        }
        let _ = self.outbound.send(Message::Close(None));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let send = Request::Send {
            request_id: 7,
            destination: "abc".into(),
            message: json!({"k": 1}),
        };
        assert_eq!(
            serde_json::to_value(&send).unwrap(),
            json!({"type": "send", "requestId": 7, "destination": "abc", "message": {"k": 1}})
        );
        assert_eq!(
            serde_json::to_value(Request::Register { request_id: 1 }).unwrap(),
            json!({"type": "register", "requestId": 1})
        );
    }

    #[tokio::test]
    async fn test_dispatch_routes_responses_and_messages() {
        let shared = Shared::default();
        let (tx, rx) = oneshot::channel();
        shared.pending().insert(3, tx);
        let (inbox, mut messages) = mpsc::unbounded_channel();
        shared.inboxes().insert("me".into(), inbox);

        shared.dispatch(r#"{"type":"response","requestId":3,"status":404,"reason":"no such uid"}"#);
        let response = rx.await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.reason.as_deref(), Some("no such uid"));

        shared.dispatch(r#"{"type":"message","destination":"me","message":{"hi":true}}"#);
        assert_eq!(messages.recv().await.unwrap(), json!({"hi": true}));

        // Garbage and unknown destinations are dropped.
        shared.dispatch("not json");
        shared.dispatch(r#"{"type":"message","destination":"other","message":1}"#);
        assert!(messages.try_recv().is_err());
    }
}
