//! Random identifiers for sessions and control transactions.

use std::fmt;

use rand::Rng;

use super::constants::{SESSION_ID_BYTES, TRANSACTION_ID_BYTES};

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Identifier of one logical stream multiplexed over a shared socket.
///
/// Chosen by the initiator and echoed by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random session ID.
    pub fn generate() -> Self {
        Self(random_hex(SESSION_ID_BYTES))
    }

    /// Borrow the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier scoping one reliable control exchange (SYN, FIN, RST, PING).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    /// Generate a fresh transaction ID.
    pub fn generate() -> Self {
        Self(random_hex(TRANSACTION_ID_BYTES))
    }

    /// Borrow the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes, as carried in a control packet payload.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Recover a transaction ID from a control packet payload.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        std::str::from_utf8(payload)
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| Self(s.to_string()))
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generate() {
        let id1 = SessionId::generate();
        let id2 = SessionId::generate();

        assert_eq!(id1.as_str().len(), SESSION_ID_BYTES * 2);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_transaction_id_payload() {
        let tid = TransactionId::generate();
        let back = TransactionId::from_payload(tid.as_bytes()).unwrap();
        assert_eq!(tid, back);

        assert!(TransactionId::from_payload(b"").is_none());
        assert!(TransactionId::from_payload(&[0xff, 0xfe]).is_none());
    }
}
