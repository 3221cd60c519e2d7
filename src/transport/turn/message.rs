//! Rendezvous messages exchanged over signaling.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{NetResult, SignalingRegistration, SocketInfo};

/// Step of the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Initiator offers its addresses.
    Connect,
    /// Responder installed its permission and answers with its addresses.
    Ready,
}

/// Addresses carried by a rendezvous message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContent {
    /// Server-reflexive address of the sender.
    pub srflx_address: SocketInfo,
    /// Relayed address of the sender.
    pub relay_address: SocketInfo,
}

/// `connect` / `ready` message of the TURN rendezvous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendezvousMessage {
    /// Sender's protocol version.
    pub version: String,
    /// Sender's signaling registration, used to reply.
    pub sender: SignalingRegistration,
    /// Rendezvous step.
    pub operation_type: OperationType,
    /// Sender's addresses.
    pub operation_content: OperationContent,
}

impl RendezvousMessage {
    /// Build a message advertising `mapped` and `relayed`.
    pub fn new(
        operation_type: OperationType,
        version: impl Into<String>,
        sender: SignalingRegistration,
        mapped: SocketAddr,
        relayed: SocketAddr,
    ) -> Self {
        Self {
            version: version.into(),
            sender,
            operation_type,
            operation_content: OperationContent {
                srflx_address: SocketInfo::from(mapped),
                relay_address: SocketInfo::from(relayed),
            },
        }
    }

    /// Relayed address of the sender.
    pub fn relay_address(&self) -> NetResult<SocketAddr> {
        self.operation_content.relay_address.to_socket_addr()
    }

    /// Encode as a signaling payload.
    pub fn to_value(&self) -> NetResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a signaling payload.
    pub fn from_value(value: Value) -> NetResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
