//! The turn pipeline: admission, serialization, session lifecycle, intent
//! resolution, step handling, and delivery tracking.
//!
//! Order per message: rate-limit admission (nothing is touched on denial),
//! then the per-user turn lock, session load, expiry handling, intent or
//! flow processing, frustration recovery, and finally persistence.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::actions::{catalog, ActionRouter};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::flow::engine::FlowEngine;
use crate::flow::step::OnboardingStep;
use crate::intent::{IntentResolution, IntentResolver};
use crate::provider::VerificationProvider;
use crate::ratelimit::RateLimiter;
use crate::retry::{RetryExecutor, RetryPolicies};
use crate::session::model::{DeliveryState, Role, Session};
use crate::session::store::{SessionManager, SessionStore};

/// The reply to one user message.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    pub message_id: String,
    pub message: String,
    pub step: OnboardingStep,
    pub data: Option<Value>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    rate_limiter: RateLimiter,
    sessions: SessionManager,
    engine: FlowEngine,
    router: ActionRouter,
    resolver: Option<Arc<dyn IntentResolver>>,
    turn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn VerificationProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let retry = RetryExecutor::new(config.retry.clone());
        Self {
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            sessions: SessionManager::new(store, config.session_restore_ceiling),
            engine: FlowEngine::new(provider.clone(), retry.clone()),
            router: ActionRouter::new(provider, retry),
            resolver: None,
            turn_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Attach an intent-resolution collaborator. Without one, every
    /// message goes straight to the step flow.
    pub fn with_resolver(mut self, resolver: Arc<dyn IntentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Process one user message end to end.
    pub async fn handle_message(&self, user_id: &str, text: &str) -> Result<TurnResponse> {
        // Admission control happens before any session state is touched:
        // a denied message leaves no trace.
        self.rate_limiter.check_and_record(user_id).await?;

        // One turn at a time per user; different users proceed in parallel.
        let lock = self.turn_lock(user_id).await;
        let _guard = lock.lock().await;

        let mut session = self.sessions.load(user_id).await;
        let expired = session.is_expired(self.config.session_idle_timeout);
        if expired {
            tracing::info!(user = %user_id, "Idle session expired, resetting progress");
            session.reset_progress();
        }

        let message_id = Uuid::new_v4().to_string();
        session.set_message_status(&message_id, DeliveryState::Processing, None);
        session.touch();
        session.push_turn(Role::User, text);

        let result = self.process(&mut session, text).await;
        let response = match result {
            Ok(mut processed) => {
                if expired {
                    processed.message = format!(
                        "Welcome back! Your session had been idle for a while, so \
                         we're picking up from the beginning.\n{}",
                        processed.message
                    );
                }
                if let Some(recovery) = self.frustration_recovery(&mut session) {
                    processed.message = format!("{}\n{recovery}", processed.message);
                }
                let delivery = if processed.failed {
                    DeliveryState::Error
                } else {
                    DeliveryState::Delivered
                };
                session.set_message_status(
                    &message_id,
                    delivery,
                    processed.function_name.as_deref(),
                );
                session.push_turn(Role::Assistant, processed.message.clone());
                Ok(TurnResponse {
                    message_id: message_id.clone(),
                    message: processed.message,
                    step: session.current_step,
                    data: processed.data,
                })
            }
            Err(e) => {
                tracing::error!(
                    user = %user_id,
                    step = %session.current_step,
                    message_id = %message_id,
                    error = %e,
                    "Turn failed"
                );
                session.set_message_status(&message_id, DeliveryState::Error, None);
                Err(e)
            }
        };

        self.sessions.save(&session).await;
        response
    }

    /// Route the message: structured action when a resolver is attached
    /// and picks one, the step flow otherwise.
    async fn process(&self, session: &mut Session, text: &str) -> Result<Processed> {
        if let Some(resolver) = &self.resolver {
            match resolver.resolve(session.conversation(), &catalog()).await {
                Ok(IntentResolution::Action { name, params }) => {
                    let outcome = self.router.dispatch(&name, params, session).await?;
                    let failed = !outcome.success;
                    let data = match &outcome.error {
                        Some(tag) => Some(json!({ "error": tag })),
                        None => outcome.data,
                    };
                    return Ok(Processed {
                        message: outcome.message,
                        data,
                        function_name: Some(name),
                        failed,
                    });
                }
                Ok(IntentResolution::Text(reply)) => {
                    return Ok(Processed {
                        message: reply,
                        data: None,
                        function_name: None,
                        failed: false,
                    });
                }
                Err(e) => {
                    // Resolution is best-effort: fall back to the step flow.
                    tracing::warn!(
                        user = %session.user_id,
                        error = %e,
                        "Intent resolution failed, using step flow"
                    );
                }
            }
        }
        let outcome = self.engine.handle_turn(session, text).await?;
        Ok(Processed {
            message: outcome.message,
            data: outcome.data,
            function_name: None,
            failed: false,
        })
    }

    /// When a step has failed too many times in a row, add guidance and
    /// reset the counter so the user isn't stuck in a loop of the same
    /// prompt.
    fn frustration_recovery(&self, session: &mut Session) -> Option<String> {
        let step = session.current_step;
        if session.failures(step) < self.config.frustration_threshold {
            return None;
        }
        tracing::info!(user = %session.user_id, step = %step, "Frustration recovery triggered");
        session.reset_failures(step);
        Some(
            "This step seems to be giving you trouble. Take your time, or reply \
             \"help\" and I'll connect you with our support team."
                .to_string(),
        )
    }

    /// Inspect a user's current session state.
    pub async fn load_session(&self, user_id: &str) -> Session {
        self.sessions.load(user_id).await
    }

    /// Seed or overwrite a user's session.
    pub async fn store_session(&self, session: &Session) {
        self.sessions.save(session).await;
    }

    async fn turn_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        // A strong count of one means only the map holds the lock: no
        // turn in flight, so the entry can go.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// One processed message, before delivery bookkeeping.
struct Processed {
    message: String,
    data: Option<Value>,
    function_name: Option<String>,
    failed: bool,
}

/// Convenience constructor covering the common case.
pub fn orchestrator_with_defaults(
    provider: Arc<dyn VerificationProvider>,
    store: Arc<dyn SessionStore>,
) -> Orchestrator {
    let config = OrchestratorConfig {
        retry: RetryPolicies::default(),
        ..OrchestratorConfig::default()
    };
    Orchestrator::new(config, provider, store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{DeviationRequest, InitiateRequest, UtilityResponse, VerificationProvider};
    use crate::session::ledger::{LedgerStep, StepStatus};
    use crate::session::store::InMemorySessionStore;
    use async_trait::async_trait;

    /// Provider that approves everything instantly.
    struct ApprovingProvider;

    fn approved(reference: &str) -> UtilityResponse {
        UtilityResponse {
            utility_reference_id: reference.to_string(),
            status: StepStatus::Approved,
            sub_status: None,
            web_url: None,
            details: None,
        }
    }

    #[async_trait]
    impl VerificationProvider for ApprovingProvider {
        async fn initiate(
            &self,
            step: LedgerStep,
            _request: InitiateRequest,
        ) -> std::result::Result<UtilityResponse, ProviderError> {
            let mut response = approved(&format!("{step}-ref"));
            response.status = StepStatus::Pending;
            Ok(response)
        }
        async fn status(
            &self,
            step: LedgerStep,
            _reference_id: &str,
        ) -> std::result::Result<UtilityResponse, ProviderError> {
            Ok(approved(&format!("{step}-ref")))
        }
        async fn confirm(
            &self,
            step: LedgerStep,
            _reference_id: &str,
            _params: Value,
        ) -> std::result::Result<UtilityResponse, ProviderError> {
            Ok(approved(&format!("{step}-ref")))
        }
        async fn resolve_deviation(
            &self,
            step: LedgerStep,
            _request: DeviationRequest,
        ) -> std::result::Result<UtilityResponse, ProviderError> {
            Ok(approved(&format!("{step}-ref")))
        }
    }

    fn orchestrator() -> Orchestrator {
        orchestrator_with_defaults(
            Arc::new(ApprovingProvider),
            Arc::new(InMemorySessionStore::new()),
        )
    }

    #[tokio::test]
    async fn first_message_starts_the_flow() {
        let orchestrator = orchestrator();
        let response = orchestrator.handle_message("u1", "hi").await.unwrap();
        assert_eq!(response.step, OnboardingStep::CollectContact);
        assert!(response.message.contains("mobile"));
    }

    #[tokio::test]
    async fn rate_limited_message_leaves_no_session_trace() {
        let provider = Arc::new(ApprovingProvider);
        let store = Arc::new(InMemorySessionStore::new());
        let mut config = OrchestratorConfig::default();
        config.rate_limit.max_per_minute = 1;
        let orchestrator = Orchestrator::new(config, provider, store.clone());

        orchestrator.handle_message("u1", "hi").await.unwrap();
        let err = orchestrator.handle_message("u1", "hello?").await.unwrap_err();
        assert!(matches!(err, Error::RateLimit(_)));

        // Only the first turn was recorded.
        let session = orchestrator.sessions.load("u1").await;
        assert_eq!(session.conversation().len(), 2);
    }

    #[tokio::test]
    async fn frustration_recovery_fires_after_repeated_failures() {
        let orchestrator = orchestrator();
        orchestrator.handle_message("u1", "hi").await.unwrap();

        // Three invalid contact messages in a row
        orchestrator.handle_message("u1", "huh").await.unwrap();
        orchestrator.handle_message("u1", "what").await.unwrap();
        let response = orchestrator.handle_message("u1", "???").await.unwrap();
        assert!(response.message.contains("support"));

        // Counter was reset by the recovery
        let session = orchestrator.sessions.load("u1").await;
        assert_eq!(session.failures(OnboardingStep::CollectContact), 0);
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let orchestrator = orchestrator();
        let mut session = Session::new("u1");
        let err = orchestrator
            .router
            .dispatch("transfer_funds", Value::Null, &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAction { .. }));
    }

    #[tokio::test]
    async fn finished_turn_locks_are_garbage_collected() {
        let orchestrator = orchestrator();
        orchestrator.handle_message("u1", "hi").await.unwrap();
        orchestrator.handle_message("u2", "hi").await.unwrap();
        orchestrator.handle_message("u3", "hi").await.unwrap();

        // Only the most recent turn's entry survives the sweep.
        assert_eq!(orchestrator.turn_locks.lock().await.len(), 1);
    }

    /// Resolver that always answers the same way; `None` simulates an
    /// outage.
    struct ScriptedResolver {
        resolution: Option<IntentResolution>,
    }

    #[async_trait]
    impl IntentResolver for ScriptedResolver {
        async fn resolve(
            &self,
            _conversation: &[crate::session::model::Turn],
            _actions: &[crate::actions::ActionDescriptor],
        ) -> std::result::Result<IntentResolution, ProviderError> {
            match &self.resolution {
                Some(resolution) => Ok(resolution.clone()),
                None => Err(ProviderError::Transient {
                    reason: "resolver down".into(),
                }),
            }
        }
    }

    fn orchestrator_with(resolution: Option<IntentResolution>) -> Orchestrator {
        orchestrator().with_resolver(Arc::new(ScriptedResolver { resolution }))
    }

    #[tokio::test]
    async fn text_resolution_is_returned_verbatim() {
        let orchestrator =
            orchestrator_with(Some(IntentResolution::Text("Happy to help.".into())));
        let response = orchestrator.handle_message("u1", "thanks!").await.unwrap();
        assert_eq!(response.message, "Happy to help.");
        // No step was driven
        assert_eq!(response.step, OnboardingStep::Init);

        let session = orchestrator.sessions.load("u1").await;
        assert_eq!(session.message_status.status, Some(DeliveryState::Delivered));
    }

    #[tokio::test]
    async fn action_resolution_dispatches_through_the_router() {
        let orchestrator = orchestrator_with(Some(IntentResolution::Action {
            name: "initiate_kyc".into(),
            params: Value::Null,
        }));
        let response = orchestrator
            .handle_message("u1", "start my kyc")
            .await
            .unwrap();
        assert!(response.message.contains("KYC"));

        let session = orchestrator.sessions.load("u1").await;
        assert!(session.ledger.get(LedgerStep::Kyc).is_some());
        assert_eq!(
            session.message_status.function_name.as_deref(),
            Some("initiate_kyc")
        );
    }

    #[tokio::test]
    async fn resolver_failure_falls_back_to_the_step_flow() {
        let orchestrator = orchestrator_with(None);
        let response = orchestrator.handle_message("u1", "hi").await.unwrap();
        assert_eq!(response.step, OnboardingStep::CollectContact);
        assert!(response.message.contains("mobile"));
    }

    #[tokio::test]
    async fn failed_action_returns_the_envelope_and_marks_the_turn() {
        let orchestrator = orchestrator_with(Some(IntentResolution::Action {
            name: "initiate_kyc".into(),
            params: Value::Null,
        }));

        let mut session = Session::new("u1");
        session
            .ledger
            .record_initiation(LedgerStep::Kyc, "kyc-open", None)
            .unwrap();
        orchestrator.store_session(&session).await;

        let response = orchestrator
            .handle_message("u1", "start my kyc again")
            .await
            .unwrap();
        assert!(response.message.contains("kyc-open"));
        assert_eq!(
            response.data,
            Some(serde_json::json!({ "error": "EXECUTION_ERROR" }))
        );

        let session = orchestrator.sessions.load("u1").await;
        assert_eq!(session.message_status.status, Some(DeliveryState::Error));
    }
}
