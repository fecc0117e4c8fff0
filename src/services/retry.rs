//! Bounded retry with exponential backoff for external store calls
//!
//! Every attempt runs under its own timeout. Only errors that report
//! `is_retryable()` are retried; everything else returns immediately.
//!
//! Writes that are not idempotent go through `call_verified`: after a
//! failure that may have been committed, the store is read back before
//! anything is sent again.

use crate::domain::error::StoreError;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// A write that `call_verified` could not complete
#[derive(Debug)]
pub enum WriteError {
    /// The store did not apply the write
    NotApplied(StoreError),
    /// The write may have landed and reading it back failed
    Indeterminate(StoreError),
}

impl WriteError {
    pub fn into_inner(self) -> StoreError {
        match self {
            WriteError::NotApplied(e) | WriteError::Indeterminate(e) => e,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry
    pub initial_interval: Duration,
    /// The maximum possible backoff between retries
    pub maximum_interval: Option<Duration>,
    /// Upper bound for a single call
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts(),
            backoff_coefficient: config.retry_backoff_coefficient(),
            initial_interval: config.retry_initial_interval(),
            maximum_interval: Some(config.retry_max_interval()),
            call_timeout: config.store_call_timeout(),
        }
    }

    /// Single attempt, no backoff
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            backoff_coefficient: 1,
            initial_interval: Duration::ZERO,
            maximum_interval: None,
            call_timeout,
        }
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt.saturating_sub(1));
        let candidate = self.initial_interval.saturating_mul(factor);
        match self.maximum_interval {
            Some(max) => candidate.min(max),
            None => candidate,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn call<T, F, Fut>(
        &self,
        op_name: &str,
        metrics: Option<&Metrics>,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.timed(op()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.retry_interval(attempt);
                    warn!(
                        op = %op_name,
                        attempt = %attempt,
                        backoff_ms = %backoff.as_millis(),
                        error = %e,
                        "store_call_retry"
                    );
                    if let Some(m) = metrics {
                        m.record_store_retry();
                    }
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a non-idempotent write. When an attempt fails in a way that may
    /// still have been committed, `confirm` reads the store back: `Some`
    /// means the write landed and is returned as success, `None` means it
    /// did not and the write may be retried.
    pub async fn call_verified<T, F, Fut, C, CFut>(
        &self,
        op_name: &str,
        metrics: Option<&Metrics>,
        mut op: F,
        mut confirm: C,
    ) -> Result<T, WriteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
        C: FnMut() -> CFut,
        CFut: Future<Output = Result<Option<T>, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let e = match self.timed(op()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if e.may_have_applied() {
                match self.timed(confirm()).await {
                    Ok(Some(value)) => {
                        info!(
                            op = %op_name,
                            attempt = %attempt,
                            error = %e,
                            "store_write_confirmed"
                        );
                        return Ok(value);
                    }
                    Ok(None) => {}
                    Err(check_error) => {
                        warn!(
                            op = %op_name,
                            error = %e,
                            check_error = %check_error,
                            "store_write_indeterminate"
                        );
                        return Err(WriteError::Indeterminate(e));
                    }
                }
            }

            if !e.is_retryable() || attempt >= max_attempts {
                return Err(WriteError::NotApplied(e));
            }

            let backoff = self.retry_interval(attempt);
            warn!(
                op = %op_name,
                attempt = %attempt,
                backoff_ms = %backoff.as_millis(),
                error = %e,
                "store_call_retry"
            );
            if let Some(m) = metrics {
                m.record_store_retry();
            }
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.call_timeout)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
