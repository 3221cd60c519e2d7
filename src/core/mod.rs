//! Core types shared by every layer: constants, errors, descriptors,
//! identifiers and the transport contract.

pub mod constants;
mod descriptor;
mod error;
mod ids;
mod traits;

pub use descriptor::*;
pub use error::*;
pub use ids::*;
pub use traits::Transport;
pub(crate) use traits::{ErrorSink, EventChannel};
