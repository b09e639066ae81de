use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::warn;

use crate::error::{Result, ScribeError};

/// Caps the number of extractions in flight. Requests over the cap wait
/// up to the queue timeout, then are turned away as saturated.
#[derive(Debug, Clone)]
pub struct Admission {
    permits: Arc<Semaphore>,
    limit: usize,
    queue_timeout: Duration,
}

impl Admission {
    pub fn new(limit: usize, queue_timeout: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            queue_timeout,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Seconds a rejected client should wait before retrying.
    pub fn retry_after_secs(&self) -> u64 {
        self.queue_timeout.as_secs_f64().ceil().max(1.0) as u64
    }

    /// Hold one slot for the lifetime of the returned permit.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        let saturated = || {
            warn!(limit = self.limit, "Extraction capacity saturated");
            ScribeError::Saturated {
                retry_after_secs: self.retry_after_secs(),
            }
        };
        let closed = || ScribeError::Internal("admission closed".to_string());

        if self.queue_timeout.is_zero() {
            return match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => Err(saturated()),
                Err(TryAcquireError::Closed) => Err(closed()),
            };
        }

        match tokio::time::timeout(self.queue_timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(closed()),
            Err(_) => Err(saturated()),
        }
    }
}
