//! TURN relay transport.
//!
//! - [`TurnClient`]: allocation lifecycle and relaying, one client per
//!   transport
//! - [`LoopbackTurnServer`]: in-process relay for tests and local setups
//! - [`RendezvousMessage`]: `connect` / `ready` exchanged over signaling
//! - [`TurnTransport`]: the [`crate::core::Transport`] built on the above

mod client;
mod loopback;
mod message;
mod relay;
mod transport;

pub use client::*;
pub use loopback::*;
pub use message::*;
pub use relay::RelayFrame;
pub use transport::*;
