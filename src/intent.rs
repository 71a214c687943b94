//! Intent resolution seam.
//!
//! The orchestrator can delegate free-text understanding to an external
//! collaborator (typically an LLM with function calling). The collaborator
//! sees the conversation and the action catalog and answers with either a
//! plain reply or a structured action request. The engine never depends on
//! a concrete implementation.

use async_trait::async_trait;
use serde_json::Value;

use crate::actions::ActionDescriptor;
use crate::error::ProviderError;
use crate::session::model::Turn;

/// What the collaborator made of the user's message.
#[derive(Debug, Clone)]
pub enum IntentResolution {
    /// A conversational reply with no action to run.
    Text(String),
    /// A request to run one catalog action.
    Action { name: String, params: Value },
}

#[async_trait]
pub trait IntentResolver: Send + Sync {
    /// Resolve the latest user message given the conversation so far and
    /// the available actions.
    async fn resolve(
        &self,
        conversation: &[Turn],
        actions: &[ActionDescriptor],
    ) -> Result<IntentResolution, ProviderError>;
}
