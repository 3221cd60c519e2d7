//! Error types for onetp.

use std::io;

use thiserror::Error;

use super::descriptor::ConnectionDescriptor;

/// Errors raised while decoding the session wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Input ended inside a field.
    #[error("unexpected end of packet")]
    UnexpectedEof,

    /// Netstring length header is not a decimal number.
    #[error("invalid netstring length header")]
    InvalidLength,

    /// Netstring is missing its trailing separator.
    #[error("missing netstring terminator")]
    MissingTerminator,

    /// Field is not valid UTF-8 where a string was expected.
    #[error("invalid utf-8 in {0} field")]
    InvalidUtf8(&'static str),

    /// Message type outside the known set.
    #[error("unknown message type: {0:#06x}")]
    UnknownType(u16),

    /// Bytes left over after the payload.
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    /// Frame exceeds the accepted maximum.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Top-level onetp errors.
///
/// Variants follow the failure taxonomy of the library: argument errors are
/// raised immediately and never retried, timeouts and aborts stay
/// distinguishable, relay and protocol failures carry a reason.
#[derive(Debug, Error)]
pub enum NetError {
    /// Malformed descriptor or missing field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Descriptor routed to the wrong transport instance.
    #[error("transport type mismatch: expected {expected}, got {actual}")]
    TransportMismatch {
        /// Tag of the transport that received the descriptor.
        expected: String,
        /// Tag carried by the descriptor.
        actual: String,
    },

    /// A reliable exchange ran out of retries.
    #[error("giving up, no more retries left")]
    RetriesExhausted,

    /// The pending operation was cancelled by its owner.
    #[error("operation aborted")]
    Aborted,

    /// TURN allocate, permission, channel or refresh request failed.
    #[error("relay failure: {0}")]
    Relay(String),

    /// Unexpected message type or order.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Signaling adapter failure.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Every connection attempt failed.
    #[error("no connection established, tried: {}", describe_attempts(.tried))]
    NoConnection {
        /// Descriptors in the order they were attempted.
        tried: Vec<ConnectionDescriptor>,
        /// One reason per attempt, same order as `tried`.
        reasons: Vec<String>,
    },

    /// Operation not legal in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The stream or transport is closed.
    #[error("closed")]
    Closed,

    /// Wire format error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding of descriptors or rendezvous messages failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetError {
    /// Check if a retry budget or per-attempt timeout ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::RetriesExhausted)
    }

    /// Check if the operation was cancelled.
    pub fn is_abort(&self) -> bool {
        matches!(self, NetError::Aborted)
    }

    /// Check if this error is raised synchronously for bad input.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            NetError::InvalidArgument(_) | NetError::TransportMismatch { .. }
        )
    }

    /// Check if the owning stream or transport cannot be used afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetError::Closed | NetError::Io(_) | NetError::ProtocolViolation(_) | NetError::Relay(_)
        )
    }
}

fn describe_attempts(tried: &[ConnectionDescriptor]) -> String {
    if tried.is_empty() {
        return "nothing".to_string();
    }
    tried
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for onetp operations.
pub type NetResult<T> = Result<T, NetError>;
