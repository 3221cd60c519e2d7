//! Server side of the net façade.

#[allow(clippy::module_inception)]
mod server;

pub use server::*;
