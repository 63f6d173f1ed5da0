//! Exponential backoff for model requests.

use crate::transport::TransportError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Scale each computed delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RetryError {
    #[error("{0}")]
    Fatal(TransportError),
    #[error("Model request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },
    #[error("Model request cancelled")]
    Cancelled,
}

impl RetryError {
    /// The transport error behind the failure, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            RetryError::Fatal(e) | RetryError::Exhausted { last: e, .. } => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `attempt` (0-based). A server-supplied
    /// retry-after wins over the computed backoff; both are capped.
    pub fn delay_for(&self, attempt: u32, err: &TransportError) -> Duration {
        let cap = Duration::from_millis(self.config.max_delay_ms);
        if let Some(after) = err.retry_after() {
            return after.min(cap);
        }

        let backoff = self
            .config
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.config.max_delay_ms);
        let millis = if self.config.jitter && backoff > 0 {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            (backoff as f64 * factor) as u64
        } else {
            backoff
        };
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails fatally, runs out of retries or
    /// `cancel` fires. `on_retry` sees each transient failure before the sleep.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: impl FnMut(u32, &TransportError, Duration),
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(RetryError::Fatal(err)),
                Err(err) => err,
            };

            if attempt >= self.config.max_retries {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }

            let delay = self.delay_for(attempt, &err);
            warn!(
                attempt = attempt + 1,
                max_attempts = self.config.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Model request failed, retrying"
            );
            on_retry(attempt, &err, delay);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
