//! Outbound connections across heterogeneous transports.
//!
//! [`create_connection`] matches every peer descriptor to the transport
//! with the same type tag and hands the resulting attempts to the
//! [scheduler](super::schedule).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::scheduler::{schedule, Attempt, SchedulePolicy};
use crate::core::{ConnectionDescriptor, NetError, NetResult, Transport};
use crate::transport::NetStream;

/// Options of [`create_connection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Attempt ordering.
    pub policy: SchedulePolicy,
}

impl ConnectConfig {
    /// Use another scheduling policy.
    pub fn with_policy(mut self, policy: SchedulePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Pair each descriptor with the first transport of the same type.
///
/// Descriptors without a matching transport are skipped.
pub fn plan_attempts(
    peers: &[ConnectionDescriptor],
    transports: &[Arc<dyn Transport>],
) -> Vec<Attempt> {
    peers
        .iter()
        .filter_map(|peer| {
            let transport = transports
                .iter()
                .find(|t| t.transport_type() == peer.transport_type);
            if transport.is_none() {
                tracing::debug!(descriptor = %peer, "no transport for descriptor, skipping");
            }
            transport.map(|t| Attempt::new(Arc::clone(t), peer.clone()))
        })
        .collect()
}

/// Connect to a peer reachable through any of `peers`.
///
/// Descriptors are tried in the given order (or all at once, see
/// [`SchedulePolicy::Parallel`]). Fails with
/// [`NetError::InvalidArgument`] when no descriptor matches any transport
/// and with [`NetError::NoConnection`] when every attempt failed.
///
/// # Example
///
/// ```ignore
/// let udp: Arc<dyn Transport> = Arc::new(UdpTransport::default());
/// let stream = create_connection(&peer_descriptors, &[udp], &ConnectConfig::default()).await?;
/// ```
pub async fn create_connection(
    peers: &[ConnectionDescriptor],
    transports: &[Arc<dyn Transport>],
    config: &ConnectConfig,
) -> NetResult<NetStream> {
    let attempts = plan_attempts(peers, transports);
    if attempts.is_empty() {
        return Err(NetError::InvalidArgument(format!(
            "none of {} peer descriptors matches a configured transport",
            peers.len()
        )));
    }
    tracing::debug!(attempts = attempts.len(), policy = ?config.policy, "connecting");
    schedule(attempts, config.policy).await
}
