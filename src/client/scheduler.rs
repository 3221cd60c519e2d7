//! Connection-establishment scheduler.
//!
//! Turns an ordered list of `(transport, descriptor)` attempts into the
//! first usable stream. Each attempt is bounded by its transport's
//! [`Transport::connect_timeout`]; an attempt that neither succeeds nor
//! fails in time counts as failed without failing the whole run. Abandoned
//! attempts are dropped, which aborts their handshakes best-effort.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};

use crate::core::{ConnectionDescriptor, NetError, NetResult, Transport};
use crate::transport::NetStream;

/// How attempts are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePolicy {
    /// One attempt at a time, in list order.
    #[default]
    Sequential,
    /// All attempts at once; the first stream wins.
    Parallel,
}

/// One transport paired with the peer descriptor it should dial.
#[derive(Clone)]
pub struct Attempt {
    /// Transport to connect with.
    pub transport: Arc<dyn Transport>,
    /// Descriptor of the peer, matching the transport's type.
    pub peer: ConnectionDescriptor,
}

impl Attempt {
    /// Pair a transport with a peer descriptor.
    pub fn new(transport: Arc<dyn Transport>, peer: ConnectionDescriptor) -> Self {
        Self { transport, peer }
    }

    async fn run(&self) -> Result<NetStream, String> {
        let timeout = self.transport.connect_timeout();
        tracing::debug!(descriptor = %self.peer, ?timeout, "connection attempt");
        match tokio::time::timeout(timeout, self.transport.connect(&self.peer)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                tracing::debug!(descriptor = %self.peer, error = %e, "connection attempt failed");
                Err(e.to_string())
            }
            Err(_) => {
                tracing::debug!(descriptor = %self.peer, "connection attempt timed out");
                Err(timed_out(timeout))
            }
        }
    }
}

impl std::fmt::Debug for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attempt")
            .field("transport", &self.transport.transport_type())
            .field("peer", &self.peer)
            .finish()
    }
}

fn timed_out(timeout: Duration) -> String {
    format!("no stream within {}ms", timeout.as_millis())
}

/// Run `attempts` under `policy`.
///
/// Resolves to the first stream, or to [`NetError::NoConnection`] naming
/// every attempted descriptor in list order with one reason each.
pub async fn schedule(attempts: Vec<Attempt>, policy: SchedulePolicy) -> NetResult<NetStream> {
    match policy {
        SchedulePolicy::Sequential => sequential(attempts).await,
        SchedulePolicy::Parallel => parallel(attempts).await,
    }
}

async fn sequential(attempts: Vec<Attempt>) -> NetResult<NetStream> {
    let mut tried = Vec::with_capacity(attempts.len());
    let mut reasons = Vec::with_capacity(attempts.len());
    for attempt in attempts {
        match attempt.run().await {
            Ok(stream) => {
                tracing::info!(descriptor = %attempt.peer, "connection established");
                return Ok(stream);
            }
            Err(reason) => {
                tried.push(attempt.peer);
                reasons.push(reason);
            }
        }
    }
    Err(NetError::NoConnection { tried, reasons })
}

async fn parallel(attempts: Vec<Attempt>) -> NetResult<NetStream> {
    let mut reasons: Vec<Option<String>> = vec![None; attempts.len()];
    let mut running: FuturesUnordered<_> = attempts
        .iter()
        .enumerate()
        .map(|(index, attempt)| async move { (index, attempt.run().await) })
        .collect();

    while let Some((index, outcome)) = running.next().await {
        match outcome {
            Ok(stream) => {
                tracing::info!(descriptor = %attempts[index].peer, "connection established");
                return Ok(stream);
            }
            Err(reason) => reasons[index] = Some(reason),
        }
    }
    drop(running);

    let tried = attempts.into_iter().map(|a| a.peer).collect();
    let reasons = reasons
        .into_iter()
        .map(|r| r.unwrap_or_else(|| "not attempted".to_string()))
        .collect();
    Err(NetError::NoConnection { tried, reasons })
}
