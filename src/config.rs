//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::retry::RetryPolicies;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Idle time after which a session's progress resets to the start.
    pub session_idle_timeout: Duration,
    /// Maximum age of a persisted session snapshot for restore.
    pub session_restore_ceiling: Duration,
    /// Consecutive failures on one step before offering recovery.
    pub frustration_threshold: u32,
    /// Rate limiter thresholds.
    pub rate_limit: RateLimitConfig,
    /// Per-class retry policies.
    pub retry: RetryPolicies,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(30 * 60),
            session_restore_ceiling: Duration::from_secs(24 * 60 * 60),
            frustration_threshold: 3,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicies::default(),
        }
    }
}

/// Sliding-window rate limit thresholds.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed in the trailing 60 seconds.
    pub max_per_minute: usize,
    /// Requests allowed in the trailing 60 minutes.
    pub max_per_hour: usize,
    /// Block applied when the per-minute threshold trips.
    pub minute_block: Duration,
    /// Block applied when the per-hour threshold trips.
    pub hour_block: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 30,
            max_per_hour: 300,
            minute_block: Duration::from_secs(5 * 60),
            hour_block: Duration::from_secs(60 * 60),
        }
    }
}

/// Configuration for the HTTP verification provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the provider gateway, without trailing slash.
    pub base_url: String,
    /// Sourcing channel code sent with every request.
    pub channel_code: String,
    /// Shared secret for request signing.
    pub secret_key: SecretString,
    /// Request timeout.
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn new(
        base_url: impl Into<String>,
        channel_code: impl Into<String>,
        secret_key: SecretString,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            channel_code: channel_code.into(),
            secret_key,
            timeout: Duration::from_secs(30),
        }
    }
}
