//! In-process signaling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Registration, Signaling, SIGNALING_LOCAL};
use crate::core::{NetError, NetResult, SessionId, SignalingRegistration};

type Table = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>>;

/// In-process signaling dispatcher.
///
/// Clones share one uid-keyed table, so transports holding clones of the
/// same `LocalSignaling` can reach each other. `close` only releases the
/// registrations made through that particular handle.
#[derive(Debug, Default)]
pub struct LocalSignaling {
    table: Table,
    owned: Mutex<Vec<String>>,
}

impl Clone for LocalSignaling {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            owned: Mutex::new(Vec::new()),
        }
    }
}

impl LocalSignaling {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live registrations across all handles.
    pub fn registrations(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Value>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owned(&self) -> MutexGuard<'_, Vec<String>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Signaling for LocalSignaling {
    fn kind(&self) -> &str {
        SIGNALING_LOCAL
    }

    async fn register(&self) -> NetResult<Registration> {
        let uid = SessionId::generate().to_string();
        let (tx, messages) = mpsc::unbounded_channel();
        self.table().insert(uid.clone(), tx);
        self.owned().push(uid.clone());
        tracing::debug!(uid = %uid, "local signaling registered");
        Ok(Registration {
            descriptor: SignalingRegistration {
                kind: SIGNALING_LOCAL.to_string(),
                uid,
                url: None,
            },
            messages,
        })
    }

    async fn send(&self, message: Value, destination: &SignalingRegistration) -> NetResult<()> {
        if destination.kind != SIGNALING_LOCAL {
            return Err(NetError::InvalidArgument(format!(
                "local signaling cannot reach a {} registration",
                destination.kind
            )));
        }
        let table = self.table();
        let inbox = table.get(&destination.uid).ok_or_else(|| {
            NetError::Signaling(format!("unknown destination {}", destination.uid))
        })?;
        inbox
            .send(message)
            .map_err(|_| NetError::Signaling(format!("destination {} is gone", destination.uid)))
    }

    async fn deregister(&self, registration: &SignalingRegistration) -> NetResult<()> {
        self.table().remove(&registration.uid);
        self.owned().retain(|uid| uid != &registration.uid);
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        let owned = std::mem::take(&mut *self.owned());
        let mut table = self.table();
        for uid in owned {
            table.remove(&uid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_messages_reach_registration() {
        let hub = LocalSignaling::new();
        let peer = hub.clone();
        let mut a = hub.register().await.unwrap();
        let b = peer.register().await.unwrap();

        peer.send(json!({"hello": "a"}), &a.descriptor).await.unwrap();
        assert_eq!(a.messages.recv().await.unwrap(), json!({"hello": "a"}));
        assert_ne!(a.descriptor.uid, b.descriptor.uid);
        assert_eq!(a.descriptor.kind, "local");
    }

    #[tokio::test]
    async fn test_unknown_destination_fails() {
        let hub = LocalSignaling::new();
        let reg = hub.register().await.unwrap();
        hub.deregister(&reg.descriptor).await.unwrap();

        let err = hub.send(json!({}), &reg.descriptor).await.unwrap_err();
        assert!(matches!(err, NetError::Signaling(_)));
    }

    #[tokio::test]
    async fn test_close_releases_only_own_registrations() {
        let hub = LocalSignaling::new();
        let other = hub.clone();
        hub.register().await.unwrap();
        let kept = other.register().await.unwrap();
        assert_eq!(hub.registrations(), 2);

        hub.close().await.unwrap();
        assert_eq!(hub.registrations(), 1);
        assert!(other.send(json!(1), &kept.descriptor).await.is_ok());
    }
}
