//! # onetp
//!
//! Transport-agnostic connection establishment for peer-to-peer
//! applications behind NATs and firewalls.
//!
//! A peer publishes one [`ConnectionDescriptor`] per way it can be reached
//! (direct UDP, direct TCP, relayed TURN). A caller hands that list to
//! [`create_connection`] together with the transports it has; the library
//! tries them sequentially or all at once and yields the first usable
//! [`NetStream`], a half-closable byte stream. Control exchanges are
//! retransmitted until confirmed; over UDP and TURN-UDP the payload itself is
//! best-effort, over TCP it is reliable and ordered.
//!
//! - **Direct UDP**: sessions with a retransmitted SYN / SYN_ACK / ACK handshake,
//!   multiplexed over one datagram socket
//! - **Direct TCP**: a PING / PONG rendezvous on top of the TCP connection
//! - **TURN relay**: relay allocations kept alive by refresh loops, with a
//!   `connect` / `ready` rendezvous over a [`signaling`] service
//!
//! ## Feature Flags
//!
//! - `websocket` (default): WebSocket relay signaling adapter
//!
//! ## Modules
//!
//! - [`core`]: constants, errors, descriptors and the [`Transport`] trait
//! - [`transport`]: packet codec, retry primitive and the three transports
//! - [`signaling`]: signaling adapters used by the TURN rendezvous
//! - [`client`]: connection scheduler and [`create_connection`]
//! - [`server`]: [`create_server`] and [`Server`]
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use onetp::prelude::*;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn run() -> NetResult<()> {
//! let transports: Vec<Arc<dyn Transport>> = vec![
//!     Arc::new(UdpTransport::default()),
//!     Arc::new(TcpTransport::default()),
//! ];
//! let server = create_server(transports.clone());
//! let descriptors = server.listen(None).await?;
//!
//! let mut client = create_connection(&descriptors, &transports, &ConnectConfig::default()).await?;
//! client.write_all(b"hello").await?;
//!
//! if let Some(mut inbound) = server.accept().await {
//!     let mut buf = [0u8; 5];
//!     inbound.read_exact(&mut buf).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod core;
pub mod server;
pub mod signaling;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{create_connection, ConnectConfig, SchedulePolicy};
    pub use crate::core::{
        ConnectionDescriptor, NetError, NetResult, SignalingRegistration, SocketInfo, Transport,
    };
    pub use crate::server::{create_server, Server};
    pub use crate::signaling::{LocalSignaling, Signaling};
    pub use crate::transport::{
        LoopbackTurnServer, NetStream, RetryConfig, TcpConfig, TcpTransport, TurnConfig,
        TurnTransport, UdpConfig, UdpTransport,
    };
}

// Re-export commonly used items at crate root
pub use crate::client::{create_connection, ConnectConfig};
pub use crate::core::{ConnectionDescriptor, NetError, NetResult, Transport};
pub use crate::server::{create_server, Server};
pub use crate::transport::NetStream;
