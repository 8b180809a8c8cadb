use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::errors::SchedulerResult;

/// 重试次数限制
pub const RETRY_COUNT: u32 = 3;

/// 有界重试策略，每次重试前随机退避
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_COUNT,
            min_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_backoff: min_backoff.min(max_backoff),
            max_backoff,
        }
    }

    /// No waiting between attempts. Handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    pub fn backoff(&self) -> Duration {
        let min = self.min_backoff.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned as is.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff();
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "operation failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
