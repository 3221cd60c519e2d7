//! Client side of the net façade.
//!
//! Builds connection attempts from a peer's descriptors and runs them
//! through the scheduler.

#[allow(clippy::module_inception)]
mod client;
mod scheduler;

pub use client::*;
pub use scheduler::*;
