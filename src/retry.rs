//! Retry classification and backoff.
//!
//! Retryability is status-based and does not look at the HTTP method, so a
//! non-idempotent POST/PUT/PATCH that fails with e.g. 503 is retried like a
//! GET. Callers that cannot tolerate duplicate side effects should pass
//! `RetryOverrides { max_attempts: Some(1), .. }` or a custom condition.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::RequestToken;
use crate::config::{Backoff, RetryConfig, RetryOverrides};
use crate::error::{ErrorInfo, RequestError};
use crate::request::{RequestDescriptor, ResponseEnvelope};

/// Custom retry predicate: `(error, attempt_just_failed) -> retry?`.
pub type RetryCondition = Arc<dyn Fn(&RequestError, u32) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryManager {
    config: RetryConfig,
    condition: Option<RetryCondition>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        RetryManager {
            config,
            condition: None,
        }
    }

    /// Replace the default status-based predicate.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// A manager with per-request overrides merged onto this one's config.
    pub fn for_request(&self, overrides: Option<&RetryOverrides>) -> Self {
        match overrides {
            Some(overrides) => RetryManager {
                config: overrides.apply(&self.config),
                condition: self.condition.clone(),
            },
            None => self.clone(),
        }
    }

    /// Cancellation and timeouts are never retried, whatever the predicate says.
    pub fn should_retry(&self, error: &RequestError, attempt: u32) -> bool {
        if error.is_cancellation() {
            return false;
        }
        match &self.condition {
            Some(condition) => condition(error, attempt),
            None => error.is_retryable_with(&self.config.retryable_errors),
        }
    }

    /// Flatten `error`, judging retryability with this manager's predicate.
    pub fn error_info(&self, error: &RequestError) -> ErrorInfo {
        ErrorInfo {
            retryable: self.should_retry(error, 1),
            ..error.info(&self.config.retryable_errors)
        }
    }

    /// Computed backoff before attempt `attempt + 1`, in milliseconds, clamped to `max_delay_ms`.
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let n = attempt.max(1);
        let initial = self.config.initial_delay_ms;
        let delay = match self.config.backoff {
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
                initial.saturating_mul(factor)
            }
            Backoff::Linear => initial.saturating_mul(u64::from(n)),
            Backoff::Fixed => initial,
        };
        delay.min(self.config.max_delay_ms)
    }

    /// Delay before the next attempt. A server `Retry-After` replaces the computed value.
    pub fn delay_for(&self, attempt: u32, error: &RequestError) -> Duration {
        let ms = match error {
            RequestError::Http {
                retry_after_ms: Some(retry_after),
                ..
            } => (*retry_after).min(self.config.max_delay_ms),
            _ => self.backoff_delay_ms(attempt),
        };
        Duration::from_millis(ms)
    }

    /// Run `attempt_fn` up to `max_attempts` times.
    ///
    /// The attempt number (starting at 1) is passed to each call. Exhaustion
    /// returns the last error unmodified. Cancellation aborts both an
    /// in-flight attempt and a pending backoff sleep.
    pub async fn execute<F, Fut>(
        &self,
        descriptor: &RequestDescriptor,
        token: &RequestToken,
        mut attempt_fn: F,
    ) -> Result<ResponseEnvelope, RequestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<ResponseEnvelope, RequestError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match token.run(attempt_fn(attempt)).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if attempt >= max_attempts || !self.should_retry(&error, attempt) {
                return Err(error);
            }

            let delay = self.delay_for(attempt, &error);
            tracing::warn!(
                "Retrying request: id={}, attempt={}, max_attempts={}, delay_ms={}, error={}",
                descriptor.id,
                attempt,
                max_attempts,
                delay.as_millis(),
                error
            );
            token.sleep(delay).await?;
            attempt += 1;
        }
    }
}

/// Parse a `Retry-After` delta-seconds value into milliseconds.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds * 1000.0).round() as u64)
}
