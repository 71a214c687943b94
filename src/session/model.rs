//! Session model — one mutable record per end user, keyed by user id.
//!
//! Mutated exclusively through the step state machine or the action
//! router; never deleted automatically. Expiry only resets progress, it
//! does not purge history.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::flow::step::OnboardingStep;
use crate::session::ledger::ReferenceLedger;

/// Contact/identity details collected during onboarding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub pan: Option<String>,
    pub name: Option<String>,
}

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn. The history is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Delivery state of the last processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Processing,
    Sent,
    Delivered,
    Error,
}

/// Last-call telemetry, overwritten each turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageStatus {
    pub last_message_id: Option<String>,
    pub status: Option<DeliveryState>,
    pub function_name: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One mutual-fund holding from a portfolio fetch. Field names follow the
/// provider's wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub scheme_name: String,
    pub isin: String,
    pub folio_number: String,
    pub units: Decimal,
    pub current_value: Decimal,
    pub available_for_pledge: bool,
}

/// Mutual-fund branch context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutualFundContext {
    pub portfolio: Vec<Holding>,
    pub pledge_amount: Option<Decimal>,
    /// Whether the user opted into the MF branch this session.
    pub branch_taken: bool,
}

impl MutualFundContext {
    /// Total value of holdings flagged pledge-eligible.
    pub fn pledgeable_value(&self) -> Decimal {
        self.portfolio
            .iter()
            .filter(|h| h.available_for_pledge)
            .map(|h| h.current_value)
            .sum()
    }
}

/// Per-user session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub current_step: OnboardingStep,
    pub opportunity_id: Option<String>,
    pub user_info: UserInfo,
    pub ledger: ReferenceLedger,
    conversation: Vec<Turn>,
    failed_attempts: HashMap<OnboardingStep, u32>,
    pub mutual_funds: MutualFundContext,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub session_duration_ms: i64,
    pub message_status: MessageStatus,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            current_step: OnboardingStep::Init,
            opportunity_id: None,
            user_info: UserInfo::default(),
            ledger: ReferenceLedger::new(),
            conversation: Vec::new(),
            failed_attempts: HashMap::new(),
            mutual_funds: MutualFundContext::default(),
            last_interaction_at: None,
            session_duration_ms: 0,
            message_status: MessageStatus::default(),
        }
    }

    /// Append a turn. There is deliberately no API to mutate history.
    pub fn push_turn(&mut self, role: Role, content: impl Into<String>) {
        self.conversation.push(Turn {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn conversation(&self) -> &[Turn] {
        &self.conversation
    }

    /// Update interaction metrics for a new turn.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if let Some(last) = self.last_interaction_at {
            self.session_duration_ms += (now - last).num_milliseconds().max(0);
        }
        self.last_interaction_at = Some(now);
    }

    /// Whether the session has been idle longer than `idle_timeout`.
    pub fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.is_expired_at(idle_timeout, Utc::now())
    }

    pub(crate) fn is_expired_at(&self, idle_timeout: Duration, now: DateTime<Utc>) -> bool {
        match self.last_interaction_at {
            Some(last) => (now - last).to_std().unwrap_or_default() > idle_timeout,
            None => false,
        }
    }

    /// Reset progress after expiry. History and the ledger are kept; only
    /// the step pointer and step counters reset.
    pub fn reset_progress(&mut self) {
        self.current_step = OnboardingStep::Init;
        self.failed_attempts.clear();
    }

    pub fn record_failure(&mut self, step: OnboardingStep) -> u32 {
        let count = self.failed_attempts.entry(step).or_insert(0);
        *count += 1;
        *count
    }

    pub fn failures(&self, step: OnboardingStep) -> u32 {
        self.failed_attempts.get(&step).copied().unwrap_or(0)
    }

    /// Reset one step's counter — on that step's successful completion or
    /// on frustration recovery.
    pub fn reset_failures(&mut self, step: OnboardingStep) {
        self.failed_attempts.remove(&step);
    }

    pub fn set_message_status(
        &mut self,
        message_id: &str,
        status: DeliveryState,
        function_name: Option<&str>,
    ) {
        self.message_status = MessageStatus {
            last_message_id: Some(message_id.to_string()),
            status: Some(status),
            function_name: function_name.map(str::to_string),
            updated_at: Some(Utc::now()),
        };
    }
}
