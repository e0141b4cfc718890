//! Process-wide pool of worker slots.

use crate::cancellation::CancellationToken;
use crate::errors::{PipegraphError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds how many node executions hold a worker at once.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// A held worker slot, returned to the pool on drop.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    /// Creates a pool with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits for a free slot, giving up when `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`PipegraphError::Stopped`] if the token is cancelled first.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<WorkerSlot> {
        if token.is_cancelled() {
            return Err(stopped(token));
        }
        tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit
                .map(|permit| WorkerSlot { _permit: permit })
                .map_err(|_| PipegraphError::Internal("worker pool closed".to_string())),
            () = token.cancelled() => Err(stopped(token)),
        }
    }
}

fn stopped(token: &CancellationToken) -> PipegraphError {
    PipegraphError::Stopped(token.reason().unwrap_or_else(|| "cancelled".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slots_are_bounded_and_returned() {
        let pool = WorkerPool::new(1);
        let token = CancellationToken::new();

        let slot = pool.acquire(&token).await.unwrap();
        assert_eq!(pool.available(), 0);
        assert!(tokio::time::timeout(Duration::from_millis(20), pool.acquire(&token))
            .await
            .is_err());

        drop(slot);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_is_cancellable() {
        let pool = WorkerPool::new(1);
        let _held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let pool = pool.clone();
            let token = token.clone();
            tokio::spawn(async move { pool.acquire(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop requested");

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PipegraphError::Stopped(ref r)) if r == "stop requested"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(WorkerPool::new(0).capacity(), 1);
    }
}
