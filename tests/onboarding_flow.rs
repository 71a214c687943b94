//! End-to-end tests for the onboarding flow against a scripted provider.
//!
//! Each test drives real user messages through the orchestrator; the
//! provider is an in-process stub whose per-step behavior the test
//! controls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use loanflow::config::OrchestratorConfig;
use loanflow::error::{Error, ProviderError};
use loanflow::flow::step::OnboardingStep;
use loanflow::orchestrator::Orchestrator;
use loanflow::provider::{DeviationRequest, InitiateRequest, UtilityResponse, VerificationProvider};
use loanflow::session::ledger::{LedgerStep, StepStatus};
use loanflow::session::store::InMemorySessionStore;

/// Scripted provider: approves everything unless a step is overridden.
struct ScriptedProvider {
    /// Status returned by polls/confirms for overridden steps.
    overrides: Mutex<HashMap<LedgerStep, UtilityResponse>>,
    /// Total provider calls, to assert that validation short-circuits.
    calls: AtomicUsize,
    /// Extra details attached to MF fetch confirmation.
    holdings: Value,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            overrides: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            holdings: json!([{
                "schemeName": "Bluechip Growth Fund",
                "isin": "INF000000001",
                "folioNumber": "1001/22",
                "units": "350.5",
                "currentValue": "75000",
                "availableForPledge": true
            }, {
                "schemeName": "Locked ELSS Fund",
                "isin": "INF000000002",
                "folioNumber": "1001/23",
                "units": "100",
                "currentValue": "40000",
                "availableForPledge": false
            }]),
        }
    }

    async fn set_override(&self, step: LedgerStep, response: UtilityResponse) {
        self.overrides.lock().await.insert(step, response);
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn approved(step: LedgerStep) -> UtilityResponse {
        UtilityResponse {
            utility_reference_id: format!("{step}-ref"),
            status: StepStatus::Approved,
            sub_status: None,
            web_url: Some(format!("https://verify.example.com/{step}")),
            details: None,
        }
    }
}

#[async_trait]
impl VerificationProvider for ScriptedProvider {
    async fn initiate(
        &self,
        step: LedgerStep,
        _request: InitiateRequest,
    ) -> Result<UtilityResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = Self::approved(step);
        response.status = StepStatus::Pending;
        if step == LedgerStep::Agreement {
            response.details = Some(json!({ "kfsReferenceId": "kfs-ref" }));
        }
        if step == LedgerStep::LoanAccount {
            response.status = StepStatus::Approved;
            response.details = Some(json!({ "fenixLoanAccountId": "LA-42" }));
        }
        Ok(response)
    }

    async fn status(
        &self,
        step: LedgerStep,
        _reference_id: &str,
    ) -> Result<UtilityResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.overrides.lock().await.get(&step) {
            return Ok(scripted.clone());
        }
        Ok(Self::approved(step))
    }

    async fn confirm(
        &self,
        step: LedgerStep,
        _reference_id: &str,
        _params: Value,
    ) -> Result<UtilityResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.overrides.lock().await.get(&step) {
            return Ok(scripted.clone());
        }
        let mut response = Self::approved(step);
        if step == LedgerStep::MfFetch {
            response.details = Some(json!({ "holdings": self.holdings }));
        }
        Ok(response)
    }

    async fn resolve_deviation(
        &self,
        step: LedgerStep,
        _request: DeviationRequest,
    ) -> Result<UtilityResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = Self::approved(step);
        response.status = StepStatus::PendingCheckerApproval;
        Ok(response)
    }
}

fn orchestrator(provider: Arc<ScriptedProvider>) -> Orchestrator {
    Orchestrator::new(
        OrchestratorConfig::default(),
        provider,
        Arc::new(InMemorySessionStore::new()),
    )
}

async fn say(o: &Orchestrator, text: &str) -> loanflow::TurnResponse {
    o.handle_message("user-1", text).await.unwrap()
}

#[tokio::test]
async fn full_path_with_mutual_fund_branch_reaches_done() {
    let provider = Arc::new(ScriptedProvider::new());
    let o = orchestrator(provider.clone());

    let r = say(&o, "hi").await;
    assert_eq!(r.step, OnboardingStep::CollectContact);

    let r = say(&o, "mobile: 9876543210, email: alice@example.com").await;
    assert_eq!(r.step, OnboardingStep::VerifyContact);

    let r = say(&o, "123456").await;
    assert_eq!(r.step, OnboardingStep::AskMfConsent);

    let r = say(&o, "yes").await;
    assert_eq!(r.step, OnboardingStep::CollectPan);

    let r = say(&o, "ABCDE1234F").await;
    assert_eq!(r.step, OnboardingStep::MfFetchOtp);

    let r = say(&o, "654321").await;
    assert_eq!(r.step, OnboardingStep::ShowMfDetails);
    assert!(r.message.contains("2 holding"));

    // Portfolio display advances to amount collection
    let r = say(&o, "ok").await;
    assert_eq!(r.step, OnboardingStep::CollectPledgeAmount);
    assert_eq!(r.data.as_ref().unwrap()["pledgeableValue"], json!("75000"));

    let r = say(&o, "₹50,000").await;
    assert_eq!(r.step, OnboardingStep::ConfirmPledge);

    let r = say(&o, "yes").await;
    assert_eq!(r.step, OnboardingStep::MfPledgeOtp);

    let r = say(&o, "111222").await;
    assert_eq!(r.step, OnboardingStep::AskKycConsent);

    let r = say(&o, "yes").await;
    assert_eq!(r.step, OnboardingStep::VerifyKyc);

    let r = say(&o, "done").await;
    assert_eq!(r.step, OnboardingStep::CollectBankDetails);

    let r = say(&o, "account 123456789012 ifsc HDFC0001234").await;
    // Bank approves instantly, so the engine carries on through mandate setup
    assert_eq!(r.step, OnboardingStep::VerifyBank);

    let r = say(&o, "checking").await;
    assert_eq!(r.step, OnboardingStep::VerifyMandate);

    let r = say(&o, "authorized").await;
    assert_eq!(r.step, OnboardingStep::VerifyAgreement);

    let r = say(&o, "signed").await;
    assert_eq!(r.step, OnboardingStep::CreateLoan);

    let r = say(&o, "yes").await;
    assert_eq!(r.step, OnboardingStep::Done);
    assert!(r.message.contains("LA-42"));
}

#[tokio::test]
async fn contact_step_creates_mobile_and_email_ledger_entries() {
    let provider = Arc::new(ScriptedProvider::new());
    let o = orchestrator(provider);

    say(&o, "hi").await;
    let r = say(&o, "mobile: 9876543210, email: alice@example.com").await;
    assert_eq!(r.step, OnboardingStep::VerifyContact);

    let session = o.load_session("user-1").await;
    assert!(session.ledger.get(LedgerStep::Mobile).is_some());
    assert!(session.ledger.get(LedgerStep::Email).is_some());
}

#[tokio::test]
async fn invalid_input_never_reaches_the_provider() {
    let provider = Arc::new(ScriptedProvider::new());
    let o = orchestrator(provider.clone());

    say(&o, "hi").await;
    let before = provider.call_count();

    // Missing email
    let r = say(&o, "my number is 9876543210").await;
    assert_eq!(r.step, OnboardingStep::CollectContact);
    assert_eq!(provider.call_count(), before);

    // Now a valid one goes through
    say(&o, "mobile: 9876543210, email: alice@example.com").await;
    assert!(provider.call_count() > before);
}

#[tokio::test]
async fn pledge_amount_over_ceiling_is_rejected_locally() {
    let provider = Arc::new(ScriptedProvider::new());
    let o = orchestrator(provider.clone());

    say(&o, "hi").await;
    say(&o, "mobile: 9876543210, email: alice@example.com").await;
    say(&o, "123456").await;
    say(&o, "yes").await;
    say(&o, "ABCDE1234F").await;
    say(&o, "654321").await;
    say(&o, "ok").await;

    let before = provider.call_count();
    // Pledgeable value is 75000 (the ELSS holding is not eligible)
    let r = say(&o, "₹80,000").await;
    assert_eq!(r.step, OnboardingStep::CollectPledgeAmount);
    assert!(r.message.contains("75000"));
    assert_eq!(provider.call_count(), before);
}

#[tokio::test]
async fn kyc_deviation_routes_through_review_and_back() {
    let provider = Arc::new(ScriptedProvider::new());
    let o = orchestrator(provider.clone());

    say(&o, "hi").await;
    say(&o, "mobile: 9876543210, email: alice@example.com").await;
    say(&o, "123456").await;
    say(&o, "no").await; // skip mutual funds
    say(&o, "yes").await; // start KYC

    // KYC comes back with a name mismatch
    provider
        .set_override(
            LedgerStep::Kyc,
            UtilityResponse {
                utility_reference_id: "kyc-ref".into(),
                status: StepStatus::InProgress,
                sub_status: Some("DEVIATION".into()),
                web_url: None,
                details: Some(json!({ "deviationDetails": { "reason": "NAME_MISMATCH" } })),
            },
        )
        .await;
    let r = say(&o, "done").await;
    assert_eq!(r.step, OnboardingStep::HandleKycDeviation);

    // A bank document can't fix a photo deviation
    let r = say(&o, "cancelled cheque").await;
    assert_eq!(r.step, OnboardingStep::HandleKycDeviation);

    let r = say(&o, "I'll use my passport").await;
    assert_eq!(r.step, OnboardingStep::VerifyKyc);

    // Checker approval counts as accepted for KYC
    provider
        .set_override(
            LedgerStep::Kyc,
            UtilityResponse {
                utility_reference_id: "kyc-ref".into(),
                status: StepStatus::PendingCheckerApproval,
                sub_status: None,
                web_url: None,
                details: None,
            },
        )
        .await;
    let r = say(&o, "status?").await;
    assert_eq!(r.step, OnboardingStep::CollectBankDetails);
}

#[tokio::test]
async fn loan_submission_requires_accepted_prerequisites() {
    let provider = Arc::new(ScriptedProvider::new());
    let o = orchestrator(provider);

    let mut session = loanflow::session::model::Session::new("user-1");
    session.current_step = OnboardingStep::CreateLoan;
    for (step, reference) in [
        (LedgerStep::Mobile, "m1"),
        (LedgerStep::Email, "e1"),
        (LedgerStep::Kyc, "k1"),
        (LedgerStep::Mandate, "n1"),
        (LedgerStep::Agreement, "a1"),
        (LedgerStep::Kfs, "f1"),
    ] {
        session.ledger.record_initiation(step, reference, None).unwrap();
        session
            .ledger
            .record_status(step, StepStatus::Approved, None, None)
            .unwrap();
    }
    // Bank verification initiated but still pending
    session
        .ledger
        .record_initiation(LedgerStep::BankAccount, "b1", None)
        .unwrap();
    o.store_session(&session).await;

    let err = o.handle_message("user-1", "yes").await.unwrap_err();
    match err {
        Error::Precondition(e) => assert_eq!(e.missing, vec!["bankAccount"]),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn reinitiation_with_open_reference_fails_without_a_call() {
    let provider = Arc::new(ScriptedProvider::new());
    let router = loanflow::actions::ActionRouter::new(
        provider.clone(),
        loanflow::retry::RetryExecutor::new(Default::default()),
    );

    let mut session = loanflow::session::model::Session::new("user-1");
    session
        .ledger
        .record_initiation(LedgerStep::Kyc, "kyc-open", None)
        .unwrap();

    let before = provider.call_count();
    let outcome = router
        .dispatch("initiate_kyc", Value::Null, &mut session)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("EXECUTION_ERROR"));
    assert!(outcome.message.contains("kyc-open"));
    assert_eq!(provider.call_count(), before);
}

#[tokio::test]
async fn contact_reentry_reinitiates_only_the_closed_leg() {
    let provider = Arc::new(ScriptedProvider::new());
    let o = orchestrator(provider.clone());

    // Mobile verification is still open, but the email attempt was
    // rejected and needs a fresh initiation.
    let mut session = loanflow::session::model::Session::new("user-1");
    session.current_step = OnboardingStep::CollectContact;
    session
        .ledger
        .record_initiation(LedgerStep::Mobile, "mob-open", None)
        .unwrap();
    session
        .ledger
        .record_initiation(LedgerStep::Email, "em-old", None)
        .unwrap();
    session
        .ledger
        .record_status(LedgerStep::Email, StepStatus::Rejected, None, None)
        .unwrap();
    o.store_session(&session).await;

    let before = provider.call_count();
    let r = say(&o, "mobile: 9876543210, email: alice@example.com").await;
    assert_eq!(r.step, OnboardingStep::VerifyContact);

    // Only the email leg went back to the provider.
    assert_eq!(provider.call_count(), before + 1);
    let session = o.load_session("user-1").await;
    assert_eq!(
        session.ledger.get(LedgerStep::Mobile).unwrap().reference_id,
        "mob-open"
    );
    assert_eq!(
        session.ledger.get(LedgerStep::Email).unwrap().reference_id,
        "email-ref"
    );
}

#[tokio::test]
async fn empty_eligible_portfolio_skips_the_pledge_branch() {
    let provider = Arc::new(ScriptedProvider::new());
    let o = orchestrator(provider.clone());

    provider
        .set_override(
            LedgerStep::MfFetch,
            UtilityResponse {
                utility_reference_id: "mf-ref".into(),
                status: StepStatus::Approved,
                sub_status: None,
                web_url: None,
                details: Some(json!({ "holdings": [{
                    "schemeName": "Locked ELSS Fund",
                    "isin": "INF000000002",
                    "folioNumber": "1001/23",
                    "units": "100",
                    "currentValue": "40000",
                    "availableForPledge": false
                }] })),
            },
        )
        .await;

    say(&o, "hi").await;
    say(&o, "mobile: 9876543210, email: alice@example.com").await;
    say(&o, "123456").await;
    say(&o, "yes").await;
    say(&o, "ABCDE1234F").await;
    let r = say(&o, "654321").await;
    assert_eq!(r.step, OnboardingStep::ShowMfDetails);

    // Nothing is pledge-eligible, so the branch exits instead of asking
    // for an amount.
    let r = say(&o, "ok").await;
    assert_eq!(r.step, OnboardingStep::AskKycConsent);
    let session = o.load_session("user-1").await;
    assert!(!session.mutual_funds.branch_taken);
}
