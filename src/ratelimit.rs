//! Per-user sliding-window rate limiter guarding pipeline admission.
//!
//! Injected as a dependency rather than process-global state; all state is
//! keyed by user id with atomic read-modify-write per call.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default)]
struct UserWindow {
    /// Admission timestamps within the trailing hour.
    requests: Vec<Instant>,
    /// Active block, if any.
    blocked_until: Option<Instant>,
}

/// Sliding-window admission control.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<HashMap<String, UserWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a request for `user_id`, recording its timestamp, or raise
    /// [`RateLimitError`] if the user is blocked or over a threshold.
    pub async fn check_and_record(&self, user_id: &str) -> Result<(), RateLimitError> {
        self.check_at(user_id, Instant::now()).await
    }

    async fn check_at(&self, user_id: &str, now: Instant) -> Result<(), RateLimitError> {
        let mut state = self.state.lock().await;
        // Evict idle users so the map stays bounded by active traffic. A
        // window survives only while it holds an active block or a request
        // within the trailing hour.
        state.retain(|_, w| {
            w.blocked_until.is_some_and(|t| now < t)
                || w.requests.iter().any(|t| now.duration_since(*t) < HOUR)
        });
        let window = state.entry(user_id.to_string()).or_default();

        window.requests.retain(|t| now.duration_since(*t) < HOUR);

        if let Some(expiry) = window.blocked_until {
            if now < expiry {
                return Err(RateLimitError {
                    retry_after: expiry - now,
                });
            }
            // Block lifted: history is cleared along with it.
            window.blocked_until = None;
            window.requests.clear();
        }

        let last_minute = window
            .requests
            .iter()
            .filter(|t| now.duration_since(**t) < MINUTE)
            .count();

        if last_minute >= self.config.max_per_minute {
            window.blocked_until = Some(now + self.config.minute_block);
            tracing::warn!(user = %user_id, "Per-minute rate limit tripped, blocking");
            return Err(RateLimitError {
                retry_after: self.config.minute_block,
            });
        }

        if window.requests.len() >= self.config.max_per_hour {
            window.blocked_until = Some(now + self.config.hour_block);
            tracing::warn!(user = %user_id, "Hourly rate limit tripped, blocking");
            return Err(RateLimitError {
                retry_after: self.config.hour_block,
            });
        }

        window.requests.push(now);
        Ok(())
    }

    #[cfg(test)]
    async fn tracked_users(&self) -> usize {
        self.state.lock().await.len()
    }
}
