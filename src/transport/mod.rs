//! Transport layer.
//!
//! Every transport hands out [`NetStream`]s, half-closable byte streams.
//! Handshakes and close exchanges are retransmitted until confirmed, but
//! DATA over UDP and TURN-UDP is sent once: loss and reordering reach the
//! reader. What sits underneath differs per transport:
//!
//! - **Wire format**: [`Packet`], netstring-framed session packets
//! - **Retransmission**: [`RetryManager`], confirm/abort driven retries
//! - **UDP**: [`UdpTransport`], sessions multiplexed over one socket
//! - **TCP**: [`TcpTransport`], each socket wrapped in a [`proxy`] stream
//! - **TURN**: [`TurnTransport`], streams relayed through a TURN server
//!
//! # Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      client / server façade             │
//! ├─────────────────────────────────────────┤
//! │   NetStream (AsyncRead + AsyncWrite)    │
//! ├─────────────┬─────────────┬─────────────┤
//! │ UDP session │ proxy (TCP) │ TURN relay  │
//! ├─────────────┴─────────────┴─────────────┤
//! │     packets, retries, sockets           │
//! └─────────────────────────────────────────┘
//! ```

mod packet;
pub mod proxy;
mod retry;
mod session;
mod socket;
mod stream;
mod tcp;
pub mod turn;
mod udp;

pub use packet::*;
pub use retry::*;
pub use session::{SessionState, UdpSession};
pub use socket::*;
pub use stream::*;
pub use tcp::*;
pub use turn::{LoopbackTurnServer, TurnClient, TurnConfig, TurnTransport};
pub use udp::*;
