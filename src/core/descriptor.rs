//! Connection descriptors.
//!
//! A descriptor tells a peer how to reach this endpoint through one
//! transport. A logical endpoint publishes an ordered list of them, one per
//! offered transport, and the client side walks that list when connecting.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use super::constants::{
    PROTOCOL_VERSION, TRANSPORT_TCP, TRANSPORT_TURN_TCP, TRANSPORT_TURN_UDP, TRANSPORT_UDP,
};
use super::error::{NetError, NetResult};

/// Address and port of a directly reachable socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketInfo {
    /// IP address in textual form.
    pub address: String,
    /// Port number.
    pub port: u16,
}

impl SocketInfo {
    /// Create socket info from an address string and port.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse into a socket address.
    pub fn to_socket_addr(&self) -> NetResult<SocketAddr> {
        let ip: IpAddr = self.address.parse().map_err(|_| {
            NetError::InvalidArgument(format!("invalid address: {}", self.address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for SocketInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Registration handed out by a signaling adapter.
///
/// Serves as the rendezvous address of a TURN endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalingRegistration {
    /// Kind of signaling adapter (`"local"`, `"websocket"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Identifier unique within the adapter.
    pub uid: String,
    /// Relay server URL, for adapters that use one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Transport-specific reachability information.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportInfo {
    /// Direct socket address (UDP, TCP).
    Socket(SocketInfo),
    /// Signaling registration (TURN).
    Signaling(SignalingRegistration),
}

/// Reachability descriptor for one transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    /// Tag matching the transport that produced this descriptor.
    pub transport_type: String,
    /// Opaque per-transport addressing data.
    pub transport_info: TransportInfo,
    /// Protocol version of the producing endpoint.
    pub version: String,
}

impl ConnectionDescriptor {
    /// Create a descriptor with the current protocol version.
    pub fn new(transport_type: impl Into<String>, transport_info: TransportInfo) -> Self {
        Self {
            transport_type: transport_type.into(),
            transport_info,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// UDP descriptor.
    pub fn udp(info: SocketInfo) -> Self {
        Self::new(TRANSPORT_UDP, TransportInfo::Socket(info))
    }

    /// TCP descriptor.
    pub fn tcp(info: SocketInfo) -> Self {
        Self::new(TRANSPORT_TCP, TransportInfo::Socket(info))
    }

    /// TURN descriptor for the given relay flavour.
    pub fn turn(transport_type: impl Into<String>, registration: SignalingRegistration) -> Self {
        Self::new(transport_type, TransportInfo::Signaling(registration))
    }

    /// Socket info, if this is a direct transport descriptor.
    pub fn socket_info(&self) -> Option<&SocketInfo> {
        match &self.transport_info {
            TransportInfo::Socket(info) => Some(info),
            TransportInfo::Signaling(_) => None,
        }
    }

    /// Signaling registration, if this is a TURN descriptor.
    pub fn registration(&self) -> Option<&SignalingRegistration> {
        match &self.transport_info {
            TransportInfo::Signaling(reg) => Some(reg),
            TransportInfo::Socket(_) => None,
        }
    }

    /// Check that this descriptor is meant for a transport tagged `expected`.
    pub fn expect_type(&self, expected: &str) -> NetResult<()> {
        if self.transport_type == expected {
            Ok(())
        } else {
            Err(NetError::TransportMismatch {
                expected: expected.to_string(),
                actual: self.transport_type.clone(),
            })
        }
    }

    /// Resolve a direct socket address, validating the transport tag.
    pub fn socket_addr(&self, expected: &str) -> NetResult<SocketAddr> {
        self.expect_type(expected)?;
        self.socket_info()
            .ok_or_else(|| {
                NetError::InvalidArgument(format!("{expected} descriptor without address/port"))
            })?
            .to_socket_addr()
    }

    /// Check whether this is a TURN descriptor.
    pub fn is_turn(&self) -> bool {
        self.transport_type == TRANSPORT_TURN_UDP || self.transport_type == TRANSPORT_TURN_TCP
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transport_info {
            TransportInfo::Socket(info) if info.address.contains(':') => {
                write!(f, "{}://[{}]:{}", self.transport_type, info.address, info.port)
            }
            TransportInfo::Socket(info) => {
                write!(f, "{}://{}:{}", self.transport_type, info.address, info.port)
            }
            TransportInfo::Signaling(reg) => {
                write!(f, "{}://{}/{}", self.transport_type, reg.kind, reg.uid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_descriptor_json_shape() {
        let desc = ConnectionDescriptor::udp(SocketInfo::new("192.168.1.2", 20000));
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["transportType"], "udp");
        assert_eq!(json["transportInfo"]["address"], "192.168.1.2");
        assert_eq!(json["transportInfo"]["port"], 20000);
        assert_eq!(json["version"], PROTOCOL_VERSION);
    }

    #[test]
    fn test_turn_descriptor_parses_as_signaling() {
        let json = r#"{
            "transportType": "turn-udp",
            "transportInfo": {"type": "websocket", "uid": "abc", "url": "ws://relay:8080"},
            "version": "0.1"
        }"#;
        let desc: ConnectionDescriptor = serde_json::from_str(json).unwrap();
        assert!(desc.is_turn());
        let reg = desc.registration().unwrap();
        assert_eq!(reg.kind, "websocket");
        assert_eq!(reg.uid, "abc");
        assert_eq!(reg.url.as_deref(), Some("ws://relay:8080"));
    }

    #[test]
    fn test_socket_addr_rejects_wrong_type() {
        let desc = ConnectionDescriptor::tcp(SocketInfo::new("127.0.0.1", 80));
        let err = desc.socket_addr(TRANSPORT_UDP).unwrap_err();
        assert!(matches!(err, NetError::TransportMismatch { .. }));
    }

    #[test]
    fn test_socket_addr_rejects_bad_address() {
        let desc = ConnectionDescriptor::udp(SocketInfo::new("not-an-ip", 80));
        let err = desc.socket_addr(TRANSPORT_UDP).unwrap_err();
        assert!(matches!(err, NetError::InvalidArgument(_)));
    }

    #[test]
    fn test_display() {
        let desc = ConnectionDescriptor::udp(SocketInfo::new("::1", 9));
        assert_eq!(desc.to_string(), "udp://[::1]:9");
        let desc = ConnectionDescriptor::turn(
            TRANSPORT_TURN_UDP,
            SignalingRegistration {
                kind: "local".into(),
                uid: "u1".into(),
                url: None,
            },
        );
        assert_eq!(desc.to_string(), "turn-udp://local/u1");
    }
}
