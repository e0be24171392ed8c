//! Process-wide limiter for provider calls.
//!
//! Bounds calls in flight with a semaphore and spaces call starts by a
//! minimum interval. Every agent invocation, from the executor or the
//! network, passes through the same limiter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::LlmError;

/// Shared call budget.
#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    min_interval: Duration,
    next_start: Mutex<Option<Instant>>,
}

/// Held for the duration of one provider call.
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            min_interval: config.min_interval,
            next_start: Mutex::new(None),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(&RateLimitConfig {
            max_concurrent: Semaphore::MAX_PERMITS,
            min_interval: Duration::ZERO,
        })
    }

    /// Wait for a slot. The permit is released when dropped.
    pub async fn acquire(&self) -> Result<RatePermit, LlmError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| LlmError::RequestFailed {
                provider: "rate_limiter".to_string(),
                reason: "limiter closed".to_string(),
            })?;

        if !self.min_interval.is_zero() {
            let start = {
                let mut next = self.next_start.lock().await;
                let now = Instant::now();
                let start = match *next {
                    Some(at) if at > now => at,
                    _ => now,
                };
                *next = Some(start + self.min_interval);
                start
            };
            tokio::time::sleep_until(start).await;
        }

        Ok(RatePermit { _permit: permit })
    }

    /// Calls that could start right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
