//! Out-of-band signaling adapters.
//!
//! The TURN transport exchanges rendezvous messages through a [`Signaling`]
//! adapter. Each registration gets a uid that peers address messages to;
//! the adapter's own wire protocol stays behind the trait.
//!
//! - [`LocalSignaling`]: in-process dispatch through a shared uid table
//! - [`WebSocketSignaling`]: one WebSocket connection to a relay server
//!   (requires the `websocket` feature)

mod local;
#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
mod websocket;

pub use local::*;
#[cfg(feature = "websocket")]
pub use websocket::*;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::{NetResult, SignalingRegistration};

/// Signaling kind tag of [`LocalSignaling`].
pub const SIGNALING_LOCAL: &str = "local";

/// Signaling kind tag of the WebSocket relay adapter.
pub const SIGNALING_WEBSOCKET: &str = "websocket";

/// A live registration: this endpoint's address plus its inbox.
#[derive(Debug)]
pub struct Registration {
    /// Address peers send messages to.
    pub descriptor: SignalingRegistration,
    /// Messages delivered to this registration, in arrival order.
    pub messages: mpsc::UnboundedReceiver<Value>,
}

/// Register/send/deregister contract of a signaling channel.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Kind tag carried in registrations (`"local"`, `"websocket"`).
    fn kind(&self) -> &str;

    /// Obtain a new reachable address.
    async fn register(&self) -> NetResult<Registration>;

    /// Deliver `message` to the registration `destination`.
    async fn send(&self, message: Value, destination: &SignalingRegistration) -> NetResult<()>;

    /// Release a registration obtained from [`Signaling::register`].
    async fn deregister(&self, registration: &SignalingRegistration) -> NetResult<()>;

    /// Release every registration and the underlying channel.
    async fn close(&self) -> NetResult<()>;
}
