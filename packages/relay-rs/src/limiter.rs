//! Global in-flight work limiter.
//!
//! Caps the number of keys being processed concurrently across all owned
//! partitions, tracks which keys are in flight for observability, and
//! provides the drain barrier graceful shutdown waits on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// In-flight work did not drain before the shutdown deadline.
#[derive(Debug, Error)]
#[error("{} keys still in flight after drain deadline", keys.len())]
pub struct DrainTimeout {
    /// Keys whose handlers were still running. Their locks expire
    /// naturally and another instance will pick the records up.
    pub keys: Vec<String>,
}

/// Caps global in-flight work and tracks in-flight keys.
pub struct ProcessingLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: DashMap<String, OwnedSemaphorePermit>,
    processed: AtomicU64,
}

impl ProcessingLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: DashMap::new(),
            processed: AtomicU64::new(0),
        }
    }

    /// Wait for a permit and mark `key` in flight.
    ///
    /// Returns `false` without taking a permit when the engine is shutting
    /// down; the caller skips the key.
    pub async fn acquire(&self, key: &str, shutdown: &CancellationToken) -> bool {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => return false,
            permit = self.semaphore.clone().acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            return false;
        };
        let previous = self.in_flight.insert(key.to_owned(), permit);
        debug_assert!(previous.is_none(), "key `{key}` acquired twice");
        true
    }

    /// Return `key`'s permit. Releasing a key that is not in flight is a
    /// bug in the caller.
    pub fn release(&self, key: &str) {
        match self.in_flight.remove(key) {
            Some(_permit) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                debug_assert!(false, "released key `{key}` was not in flight");
                error!(key = %key, "released a key that was not in flight");
            }
        }
    }

    /// Block until every permit is free, up to `deadline`.
    ///
    /// Holding all permits also prevents new acquisitions, which is the
    /// desired behavior during shutdown.
    pub async fn await_all(&self, deadline: Duration) -> Result<(), DrainTimeout> {
        let drained =
            tokio::time::timeout(deadline, self.semaphore.acquire_many(self.capacity as u32)).await;
        match drained {
            Ok(Ok(permits)) => {
                drop(permits);
                Ok(())
            }
            Ok(Err(_closed)) => Ok(()),
            Err(_elapsed) => Err(DrainTimeout {
                keys: self.in_flight_keys(),
            }),
        }
    }

    /// Snapshot of the keys currently being processed.
    pub fn in_flight_keys(&self) -> Vec<String> {
        self.in_flight.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of keys processed (released) since startup.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for ProcessingLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingLimiter")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight.len())
            .field("processed", &self.processed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let limiter = ProcessingLimiter::new(2);
        let token = CancellationToken::new();

        assert!(limiter.acquire("a", &token).await);
        assert!(limiter.acquire("b", &token).await);
        assert_eq!(limiter.in_flight_keys().len(), 2);

        limiter.release("a");
        limiter.release("b");
        assert!(limiter.in_flight_keys().is_empty());
        assert_eq!(limiter.processed(), 2);
    }

    #[tokio::test]
    async fn test_capacity_blocks_until_release() {
        let limiter = Arc::new(ProcessingLimiter::new(1));
        let token = CancellationToken::new();

        assert!(limiter.acquire("a", &token).await);

        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire("b", &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        limiter.release("a");
        assert!(waiter.await.unwrap());
        limiter.release("b");
    }

    #[tokio::test]
    async fn test_acquire_returns_false_on_shutdown() {
        let limiter = ProcessingLimiter::new(1);
        let token = CancellationToken::new();
        assert!(limiter.acquire("a", &token).await);

        token.cancel();
        assert!(!limiter.acquire("b", &token).await);
        limiter.release("a");
    }

    #[tokio::test]
    async fn test_await_all_waits_for_in_flight_work() {
        let limiter = Arc::new(ProcessingLimiter::new(2));
        let token = CancellationToken::new();
        assert!(limiter.acquire("a", &token).await);

        let releaser = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                limiter.release("a");
            })
        };

        limiter.await_all(Duration::from_secs(1)).await.unwrap();
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_await_all_times_out_and_reports_keys() {
        let limiter = ProcessingLimiter::new(1);
        let token = CancellationToken::new();
        assert!(limiter.acquire("stuck", &token).await);

        let err = limiter.await_all(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.keys, vec!["stuck".to_owned()]);
        limiter.release("stuck");
    }
}
