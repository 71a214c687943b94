//! Retry/backoff executor — wraps a single external call with bounded
//! retries, exponential delay, and jitter.
//!
//! Classification lives on the error type via [`Retryable`], so the
//! executor never inspects provider specifics. Non-retryable errors
//! (validation, authentication, non-429 4xx) are rethrown immediately; the
//! final attempt's error is returned unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::ProviderError;

/// Operation classes with distinct retry characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    /// Status polls and verification checks.
    Verification,
    /// Document submissions.
    Upload,
    /// Everything else (initiations, account creation).
    Api,
}

/// Immutable retry configuration for one operation class.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub initial_delay: Duration,
    /// Uniform jitter as a fraction of the computed delay (±).
    pub jitter_fraction: f64,
}

/// The full set of per-class policies.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    pub verification: RetryPolicy,
    pub upload: RetryPolicy,
    pub api: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            verification: RetryPolicy {
                max_attempts: 3,
                backoff_factor: 1.5,
                initial_delay: Duration::from_millis(1000),
                jitter_fraction: 0.2,
            },
            upload: RetryPolicy {
                max_attempts: 2,
                backoff_factor: 2.0,
                initial_delay: Duration::from_millis(2000),
                jitter_fraction: 0.1,
            },
            api: RetryPolicy {
                max_attempts: 4,
                backoff_factor: 1.2,
                initial_delay: Duration::from_millis(500),
                jitter_fraction: 0.15,
            },
        }
    }
}

impl RetryPolicies {
    pub fn get(&self, class: OperationClass) -> &RetryPolicy {
        match class {
            OperationClass::Verification => &self.verification,
            OperationClass::Upload => &self.upload,
            OperationClass::Api => &self.api,
        }
    }
}

/// Errors that can tell the executor whether a re-attempt is worthwhile.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Executes operations under a per-class retry policy.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policies: RetryPolicies,
}

impl RetryExecutor {
    pub fn new(policies: RetryPolicies) -> Self {
        Self { policies }
    }

    /// Run `op` under the policy for `class`.
    ///
    /// Returns the first success, rethrows the first non-retryable error,
    /// or returns the last error after exhausting attempts.
    pub async fn execute<T, E, F, Fut>(&self, class: OperationClass, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.policies.get(class);
        let mut attempt = 1u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= policy.max_attempts => return Err(e),
                Err(e) => {
                    let delay = Self::delay_for(policy, attempt);
                    tracing::warn!(
                        class = ?class,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Exponential delay with uniform jitter for a given (1-based) attempt.
    fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base =
            policy.initial_delay.as_secs_f64() * policy.backoff_factor.powi(attempt as i32 - 1);
        let jitter = base * policy.jitter_fraction;
        let adjusted = base + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64(adjusted.max(0.0))
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicies::default())
    }
}
