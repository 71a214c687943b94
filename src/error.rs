//! Error types for the onboarding orchestration engine.

use std::time::Duration;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Conflict error: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Precondition error: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Unknown action: {name}")]
    UnknownAction { name: String },
}

/// Locally detected bad input. Never retried; surfaced verbatim with
/// guidance to correct and resubmit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required parameters: {}", .fields.join(", "))]
    MissingFields { fields: Vec<String> },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid format for {field}, expected {expected}")]
    InvalidFormat { field: String, expected: String },
}

/// Credential or signature failure at the provider boundary.
/// Fatal for the turn — a configuration problem, not a user input problem.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthenticationError {
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Provider rejected request signature: {reason}")]
    SignatureRejected { reason: String },
}

/// Admission denied by the rate limiter. Carries how long to wait.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Too many requests, retry after {retry_after:?}")]
pub struct RateLimitError {
    pub retry_after: Duration,
}

/// Attempted re-initiation of a step that already has an open
/// (non-terminal) reference. Poll status or resolve the deviation first.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Step {step} already has open reference {reference_id}")]
pub struct ConflictError {
    pub step: String,
    pub reference_id: String,
}

/// Terminal action attempted with incomplete prerequisites.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Prerequisites not satisfied: {}", .missing.join(", "))]
pub struct PreconditionError {
    /// Ledger steps that are missing or not in an accepted status.
    pub missing: Vec<String>,
}

/// Errors from external verification providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Network-level failure, 5xx, or 429. Retried by the executor.
    #[error("Transient provider failure: {reason}")]
    Transient { reason: String },

    /// Upstream 4xx (other than 429). Not retried.
    #[error("Provider returned {status}: {message}")]
    Api {
        status: u16,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// 401 or local credential failure. Not retried.
    #[error("Provider authentication failed: {0}")]
    Auth(#[from] AuthenticationError),

    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether the retry executor may re-attempt this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Session persistence errors. Save failures are logged and swallowed by
/// the session manager — they never abort a turn.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to load session for {user_id}: {reason}")]
    Load { user_id: String, reason: String },

    #[error("Failed to save session for {user_id}: {reason}")]
    Save { user_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
