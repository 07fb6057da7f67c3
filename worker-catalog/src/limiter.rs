use crate::error::LimiterError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Default number of concurrent in-flight calls per client
pub const DEFAULT_CAPACITY: usize = 3;

/// Counting gate bounding simultaneous in-flight calls through a shared client.
///
/// Waiters are served strictly in arrival order: a released permit is handed
/// to the oldest queued waiter before anyone else can pick it up. Clones share
/// the same permit pool.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held permit. Dropping it (or calling [`LimiterPermit::release`]) returns
/// the permit to the limiter.
#[derive(Debug)]
#[must_use = "the permit is released as soon as it is dropped"]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl LimiterPermit {
    pub fn release(self) {
        drop(self);
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Result<Self, LimiterError> {
        if capacity == 0 {
            return Err(LimiterError::InvalidCapacity { capacity });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Wait for a permit, queueing behind earlier waiters
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;
        trace!(
            "Acquired limiter permit ({} of {} in flight)",
            self.in_flight(),
            self.capacity
        );
        Ok(LimiterPermit { _permit: permit })
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| LimiterPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(DEFAULT_CAPACITY)),
            capacity: DEFAULT_CAPACITY,
        }
    }
}
