//! Bounded exponential retry policy for transient failures

use crate::config::EngineConfig;
use crate::error::{SolverError, SolverResult};

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with a hard attempt bound
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial,
            max,
            multiplier: 2.0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            Duration::from_millis(config.retry_initial_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), or `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max.as_millis() as f64);
        Some(Duration::from_millis(delay_ms as u64))
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> SolverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SolverResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => match self.delay_for(attempt) {
                    Some(delay) => {
                        warn!(
                            "{} failed (attempt {}/{}), retrying in {:?}: {}",
                            name, attempt, self.max_attempts, delay, e
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Bound a single remote call by `limit`
pub async fn with_timeout<T, Fut>(operation: &str, limit: Duration, fut: Fut) -> SolverResult<T>
where
    Fut: Future<Output = SolverResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SolverError::Timeout {
            operation: operation.to_string(),
        })?
}
