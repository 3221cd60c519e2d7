//! Confirm/abort driven retransmission.
//!
//! [`RetryManager::execute_until_confirmed`] runs an operation once, then
//! re-runs it every time its timer expires until somebody calls
//! [`RetryManager::confirm`] or [`RetryManager::abort`] with the same
//! operation ID, or the retry budget runs out. Packet-processing code
//! resolves operations by ID, so the caller awaiting the exchange never has
//! to poll.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::constants::{DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_DELAY};
use crate::core::{NetError, NetResult};

/// Retry behaviour for one reliable exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Re-invocations after the initial one.
    pub max_retries: u32,
    /// Delay before the first re-invocation.
    pub timeout_delay: Duration,
    /// Ceiling for the delay when backing off.
    pub max_delay: Duration,
    /// Double the delay after every expiry.
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_delay: DEFAULT_TIMEOUT_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            exponential_backoff: false,
        }
    }
}

impl RetryConfig {
    /// Same settings with another delay and retry count.
    pub fn with_schedule(mut self, delay: Duration, retries: u32) -> Self {
        self.timeout_delay = delay;
        self.max_retries = retries;
        self
    }

    /// Upper bound of the time spent before giving up.
    pub fn budget(&self) -> Duration {
        let mut delay = self.timeout_delay;
        let mut total = Duration::ZERO;
        for _ in 0..=self.max_retries {
            total += delay;
            if self.exponential_backoff {
                delay = (delay * 2).min(self.max_delay);
            }
        }
        total
    }
}

#[derive(Debug)]
enum Resolution {
    Confirmed,
    Aborted,
}

/// One registration; `generation` tells a reused ID apart from its
/// predecessor.
#[derive(Debug)]
struct Pending {
    generation: u64,
    tx: oneshot::Sender<Resolution>,
}

type PendingTable = Arc<Mutex<HashMap<String, Pending>>>;

/// Table of outstanding reliable operations, addressable by ID.
///
/// Cheap to clone; clones share the table.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    pending: PendingTable,
    generations: Arc<AtomicU64>,
    config: RetryConfig,
}

/// Removes the table entry when the awaiting future completes or is dropped.
struct PendingGuard {
    pending: PendingTable,
    id: String,
    generation: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut table) = self.pending.lock() {
            if table.get(&self.id).is_some_and(|p| p.generation == self.generation) {
                table.remove(&self.id);
            }
        }
    }
}

impl RetryManager {
    /// Create a manager with the given defaults.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            pending: PendingTable::default(),
            generations: Arc::default(),
            config,
        }
    }

    /// Run `operation` until `operation_id` is confirmed, using the defaults.
    pub async fn execute_until_confirmed<F, Fut>(
        &self,
        operation_id: &str,
        operation: F,
    ) -> NetResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NetResult<()>>,
    {
        let config = self.config;
        self.execute_until_confirmed_with(operation_id, &config, operation)
            .await
    }

    /// Run `operation` until `operation_id` is confirmed.
    ///
    /// The operation runs once immediately, then once per timer expiry while
    /// retries remain. An error returned by the operation fails the call at
    /// once, without retrying. Resolves to [`NetError::Aborted`] after
    /// [`Self::abort`] and to [`NetError::RetriesExhausted`] when the budget
    /// is spent. Dropping the returned future deregisters the operation.
    pub async fn execute_until_confirmed_with<F, Fut>(
        &self,
        operation_id: &str,
        config: &RetryConfig,
        mut operation: F,
    ) -> NetResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NetResult<()>>,
    {
        let (tx, mut rx) = oneshot::channel();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self
                .pending
                .lock()
                .map_err(|_| NetError::InvalidState("retry table poisoned".into()))?;
            if table.contains_key(operation_id) {
                return Err(NetError::InvalidArgument(format!(
                    "operation {operation_id} is already pending"
                )));
            }
            table.insert(operation_id.to_string(), Pending { generation, tx });
        }
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: operation_id.to_string(),
            generation,
        };

        operation().await?;

        let mut delay = config.timeout_delay;
        let mut retries_left = config.max_retries;
        loop {
            tokio::select! {
                resolution = &mut rx => {
                    return match resolution {
                        Ok(Resolution::Confirmed) => Ok(()),
                        Ok(Resolution::Aborted) | Err(_) => Err(NetError::Aborted),
                    };
                }
                _ = tokio::time::sleep(delay) => {
                    if retries_left == 0 {
                        tracing::debug!(operation = operation_id, "giving up, no more retries left");
                        return Err(NetError::RetriesExhausted);
                    }
                    retries_left -= 1;
                    if config.exponential_backoff {
                        delay = (delay * 2).min(config.max_delay);
                    }
                    tracing::trace!(operation = operation_id, retries_left, "retrying");
                    operation().await?;
                }
            }
        }
    }

    /// Resolve a pending operation successfully.
    ///
    /// Returns `false` if nothing was pending under this ID.
    pub fn confirm(&self, operation_id: &str) -> bool {
        self.resolve(operation_id, Resolution::Confirmed)
    }

    /// Fail a pending operation with [`NetError::Aborted`].
    ///
    /// Returns `false` if nothing was pending under this ID.
    pub fn abort(&self, operation_id: &str) -> bool {
        self.resolve(operation_id, Resolution::Aborted)
    }

    /// Check whether an operation is outstanding.
    pub fn is_pending(&self, operation_id: &str) -> bool {
        self.pending
            .lock()
            .map(|table| table.contains_key(operation_id))
            .unwrap_or(false)
    }

    fn resolve(&self, operation_id: &str, resolution: Resolution) -> bool {
        let sender = match self.pending.lock() {
            Ok(mut table) => table.remove(operation_id),
            Err(_) => None,
        };
        match sender {
            Some(pending) => pending.tx.send(resolution).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_op(count: &Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<NetResult<()>> {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_before_timer() {
        let retry = RetryManager::default();
        let count = Arc::new(AtomicU32::new(0));

        let confirmer = retry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(confirmer.confirm("op"));
        });

        retry
            .execute_until_confirmed("op", counting_op(&count))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!retry.is_pending("op"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_runs_initial_plus_retries() {
        let retry = RetryManager::default();
        let count = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::default().with_schedule(Duration::from_millis(50), 2);

        let err = retry
            .execute_until_confirmed_with("op", &config, counting_op(&count))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "giving up, no more retries left");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_regardless_of_retries() {
        let retry = RetryManager::default();
        let count = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::default().with_schedule(Duration::from_millis(50), 100);

        let aborter = retry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            assert!(aborter.abort("op"));
        });

        let err = retry
            .execute_until_confirmed_with("op", &config, counting_op(&count))
            .await
            .unwrap_err();
        assert!(err.is_abort());
        assert_eq!(err.to_string(), "operation aborted");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_operation_error_fails_without_retry() {
        let retry = RetryManager::default();
        let count = Arc::new(AtomicU32::new(0));
        let inner = Arc::clone(&count);
        let err = retry
            .execute_until_confirmed("op", move || {
                inner.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(NetError::InvalidArgument("bad".into())))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidArgument(_)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!retry.is_pending("op"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_timing() {
        let retry = RetryManager::default();
        let config = RetryConfig {
            max_retries: 3,
            timeout_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            exponential_backoff: true,
        };
        let times = Arc::new(Mutex::new(Vec::new()));
        let start = tokio::time::Instant::now();
        let recorder = Arc::clone(&times);

        let _ = retry
            .execute_until_confirmed_with("op", &config, move || {
                recorder.lock().unwrap().push(start.elapsed());
                std::future::ready(Ok(()))
            })
            .await;

        let times = times.lock().unwrap().clone();
        let ms: Vec<u128> = times.iter().map(|d| d.as_millis()).collect();
        // 0, +100, +200, +300 (capped)
        assert_eq!(ms, vec![0, 100, 300, 600]);
        assert_eq!(config.budget(), Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_rejected() {
        let retry = RetryManager::default();
        let config = RetryConfig::default().with_schedule(Duration::from_secs(60), 0);

        let first = {
            let retry = retry.clone();
            tokio::spawn(async move {
                retry
                    .execute_until_confirmed_with("dup", &config, || std::future::ready(Ok(())))
                    .await
            })
        };
        while !retry.is_pending("dup") {
            tokio::task::yield_now().await;
        }

        let err = retry
            .execute_until_confirmed_with("dup", &config, || std::future::ready(Ok(())))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidArgument(_)));

        assert!(retry.confirm("dup"));
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_deregisters() {
        let retry = RetryManager::default();
        let fut = retry.execute_until_confirmed("gone", || std::future::ready(Ok(())));
        let _ = tokio::time::timeout(Duration::from_millis(10), fut).await;
        assert!(!retry.is_pending("gone"));
        assert!(!retry.confirm("gone"));
    }

    #[test]
    fn test_confirm_unknown_is_noop() {
        let retry = RetryManager::default();
        assert!(!retry.confirm("nothing"));
        assert!(!retry.abort("nothing"));
    }

    #[tokio::test]
    async fn test_finished_caller_leaves_reused_id_alone() {
        let retry = RetryManager::default();
        let config = RetryConfig::default().with_schedule(Duration::from_secs(60), 0);

        let first = retry.execute_until_confirmed_with("peer", &config, || std::future::ready(Ok(())));
        tokio::pin!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(retry.confirm("peer"));

        // The ID is free again before the first caller has observed its result.
        let second = {
            let retry = retry.clone();
            tokio::spawn(async move {
                retry
                    .execute_until_confirmed_with("peer", &config, || std::future::ready(Ok(())))
                    .await
            })
        };
        while !retry.is_pending("peer") {
            tokio::task::yield_now().await;
        }

        first.await.unwrap();
        assert!(retry.is_pending("peer"));
        assert!(retry.confirm("peer"));
        second.await.unwrap().unwrap();
    }
}
