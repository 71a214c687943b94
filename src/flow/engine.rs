//! Conversational flow engine — drives one user message through the
//! current onboarding step.
//!
//! Each handler follows the same shape: validate the raw input locally,
//! check the ledger before touching the network, run the provider call
//! under the retry executor, fold the result into the ledger, then advance
//! along the step graph. Invalid input or a failed call re-enters the same
//! step with the failure counter bumped; the orchestrator watches that
//! counter for frustration recovery.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Error, PreconditionError, ProviderError, Result};
use crate::flow::input;
use crate::flow::step::OnboardingStep;
use crate::provider::{
    DeviationDocument, DeviationReason, DeviationRequest, InitiateRequest, UtilityResponse,
    VerificationProvider,
};
use crate::retry::{OperationClass, RetryExecutor};
use crate::session::ledger::LedgerStep;
use crate::session::model::Session;

/// The result of processing one message.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Assistant reply for the user.
    pub message: String,
    /// The step the session is in after this turn.
    pub step: OnboardingStep,
    /// Structured payload for programmatic consumers (reference ids,
    /// redirect URLs, portfolio summaries).
    pub data: Option<Value>,
}

impl StepOutcome {
    fn new(session: &Session, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step: session.current_step,
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Ledger steps every loan submission requires.
const BASE_LOAN_PREREQUISITES: &[LedgerStep] = &[
    LedgerStep::Mobile,
    LedgerStep::Email,
    LedgerStep::Kyc,
    LedgerStep::BankAccount,
    LedgerStep::Mandate,
    LedgerStep::Agreement,
    LedgerStep::Kfs,
];

/// Check that every prerequisite step holds an accepted reference. The
/// pledge reference is required only when the user took the mutual-fund
/// branch.
pub fn loan_prerequisites(session: &Session) -> std::result::Result<(), PreconditionError> {
    let mut required = BASE_LOAN_PREREQUISITES.to_vec();
    if session.mutual_funds.branch_taken {
        required.push(LedgerStep::MfPledge);
    }
    let missing = session.ledger.unsatisfied(&required);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PreconditionError {
            missing: missing.iter().map(ToString::to_string).collect(),
        })
    }
}

pub struct FlowEngine {
    provider: Arc<dyn VerificationProvider>,
    retry: RetryExecutor,
}

impl FlowEngine {
    pub fn new(provider: Arc<dyn VerificationProvider>, retry: RetryExecutor) -> Self {
        Self { provider, retry }
    }

    /// Process one user message against the session's current step.
    pub async fn handle_turn(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        use OnboardingStep::*;
        match session.current_step {
            Init => self.start(session),
            CollectContact => self.collect_contact(session, input).await,
            VerifyContact => self.verify_contact(session, input).await,
            AskMfConsent => self.ask_mf_consent(session, input),
            CollectPan => self.collect_pan(session, input).await,
            MfFetchOtp => self.mf_fetch_otp(session, input).await,
            ShowMfDetails => self.show_mf_details(session),
            CollectPledgeAmount => self.collect_pledge_amount(session, input),
            ConfirmPledge => self.confirm_pledge(session, input).await,
            MfPledgeOtp => self.mf_pledge_otp(session, input).await,
            AskKycConsent => self.ask_kyc_consent(session, input).await,
            InitiateKyc => self.initiate_kyc(session).await,
            VerifyKyc => self.verify_kyc(session).await,
            HandleKycDeviation => self.handle_deviation(session, input, LedgerStep::Kyc).await,
            CollectBankDetails => self.collect_bank_details(session, input).await,
            VerifyBank => self.verify_bank(session).await,
            HandleBankDeviation => {
                self.handle_deviation(session, input, LedgerStep::BankAccount)
                    .await
            }
            SetupMandate => self.setup_mandate(session).await,
            VerifyMandate => self.verify_mandate(session).await,
            SetupAgreement => self.setup_agreement(session).await,
            VerifyAgreement => self.verify_agreement(session).await,
            CreateLoan => self.create_loan(session, input).await,
            Done => Ok(StepOutcome::new(
                session,
                "Your onboarding is complete. Our team will reach out with next steps.",
            )),
        }
    }

    // --- step handlers -------------------------------------------------

    fn start(&self, session: &mut Session) -> Result<StepOutcome> {
        session
            .opportunity_id
            .get_or_insert_with(|| Uuid::new_v4().to_string());
        advance(session, OnboardingStep::CollectContact);
        Ok(StepOutcome::new(
            session,
            "Welcome! To get started with your loan application, please share \
             your mobile number and email address.",
        ))
    }

    async fn collect_contact(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        let contact = match input::parse_contact(input) {
            Ok(c) => c,
            Err(e) => {
                return Ok(self.retry_prompt(
                    session,
                    format!(
                        "{e}. Please share both together, for example: \
                         \"mobile: 9876543210, email: you@example.com\"."
                    ),
                ));
            }
        };
        session.user_info.mobile = Some(contact.mobile.clone());
        session.user_info.email = Some(contact.email.clone());

        // Re-entry: each leg is checked on its own. A leg with an open
        // reference is reused as-is; only legs that are missing or closed
        // terminally go back to the provider.
        let need_mobile = session.ledger.open_reference(LedgerStep::Mobile).is_none();
        let need_email = session.ledger.open_reference(LedgerStep::Email).is_none();
        if !need_mobile && !need_email {
            advance(session, OnboardingStep::VerifyContact);
            return Ok(StepOutcome::new(
                session,
                "Verification is already underway. Please reply with the 6-digit \
                 OTP sent to your mobile.",
            ));
        }

        let opportunity_id = session.opportunity_id.clone().unwrap_or_default();
        let mobile_request = InitiateRequest {
            opportunity_id: opportunity_id.clone(),
            params: json!({
                "verificationType": "MOBILE",
                "verificationMethod": "OTP",
                "verifiedValue": contact.mobile,
            }),
        };
        let email_request = InitiateRequest {
            opportunity_id,
            params: json!({
                "verificationType": "EMAIL",
                "verificationMethod": "LINK",
                "verifiedValue": contact.email,
            }),
        };

        // The legs that need (re-)initiation start together.
        let (mobile, email) = futures::future::join(
            async {
                if need_mobile {
                    self.initiate(OperationClass::Api, LedgerStep::Mobile, mobile_request)
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            },
            async {
                if need_email {
                    self.initiate(OperationClass::Api, LedgerStep::Email, email_request)
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            },
        )
        .await;

        match (mobile, email) {
            (Ok(mobile), Ok(email)) => {
                if let Some(mobile) = mobile {
                    session.ledger.record_initiation(
                        LedgerStep::Mobile,
                        mobile.utility_reference_id,
                        mobile.web_url,
                    )?;
                }
                let email_url = email.as_ref().and_then(|e| e.web_url.clone());
                if let Some(email) = email {
                    session.ledger.record_initiation(
                        LedgerStep::Email,
                        email.utility_reference_id,
                        email.web_url,
                    )?;
                }
                advance(session, OnboardingStep::VerifyContact);
                let mut outcome = StepOutcome::new(
                    session,
                    "Thanks! An OTP has been sent to your mobile and a verification \
                     link to your email. Please reply with the 6-digit OTP.",
                );
                if let Some(url) = email_url {
                    outcome = outcome.with_data(json!({ "emailVerificationUrl": url }));
                }
                Ok(outcome)
            }
            (mobile, email) => {
                let error = mobile.err().or(email.err()).unwrap_or_else(|| {
                    ProviderError::InvalidResponse("missing response".into())
                });
                self.provider_failure(
                    session,
                    error,
                    "I couldn't start contact verification just now. Please share \
                     your mobile and email once more.",
                )
            }
        }
    }

    async fn verify_contact(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        let otp = match input::parse_otp(input) {
            Ok(o) => o,
            Err(e) => return Ok(self.retry_prompt(session, format!("{e}."))),
        };
        let (Some(mobile_ref), Some(email_ref)) = (
            session
                .ledger
                .get(LedgerStep::Mobile)
                .map(|r| r.reference_id.clone()),
            session
                .ledger
                .get(LedgerStep::Email)
                .map(|r| r.reference_id.clone()),
        ) else {
            return Ok(self.retry_prompt(
                session,
                "I can't find an active verification. Please share your mobile \
                 and email again.",
            ));
        };

        let (mobile, email) = futures::future::join(
            self.confirm(
                OperationClass::Verification,
                LedgerStep::Mobile,
                &mobile_ref,
                json!({ "verificationMethod": "OTP", "otp": otp }),
            ),
            self.poll(LedgerStep::Email, &email_ref),
        )
        .await;

        let (mobile, email) = match (mobile, email) {
            (Ok(m), Ok(e)) => (m, e),
            (mobile, email) => {
                let error = mobile.err().or(email.err()).unwrap_or_else(|| {
                    ProviderError::InvalidResponse("missing response".into())
                });
                return self.provider_failure(
                    session,
                    error,
                    "I couldn't verify the OTP just now. Please try again in a moment.",
                );
            }
        };

        session.ledger.record_status(
            LedgerStep::Mobile,
            mobile.status,
            mobile.sub_status,
            mobile.details,
        )?;
        session.ledger.record_status(
            LedgerStep::Email,
            email.status,
            email.sub_status,
            email.details,
        )?;

        if session.ledger.is_accepted(LedgerStep::Mobile)
            && session.ledger.is_accepted(LedgerStep::Email)
        {
            advance(session, OnboardingStep::AskMfConsent);
            Ok(StepOutcome::new(
                session,
                "Your contact details are verified. Would you like to pledge \
                 mutual-fund holdings to unlock a higher limit? (yes/no)",
            ))
        } else if !session.ledger.is_accepted(LedgerStep::Email) {
            Ok(self.retry_prompt(
                session,
                "The OTP checked out, but your email link hasn't been confirmed \
                 yet. Please click the link we emailed you, then resend the OTP.",
            ))
        } else {
            Ok(self.retry_prompt(
                session,
                "That OTP didn't match. Please check the code and try again.",
            ))
        }
    }

    fn ask_mf_consent(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        match input::parse_yes_no(input) {
            Some(true) => {
                session.mutual_funds.branch_taken = true;
                advance(session, OnboardingStep::CollectPan);
                Ok(StepOutcome::new(
                    session,
                    "Great. Please share your PAN so I can fetch your mutual-fund \
                     portfolio.",
                ))
            }
            Some(false) => {
                session.mutual_funds.branch_taken = false;
                advance(session, OnboardingStep::AskKycConsent);
                Ok(StepOutcome::new(
                    session,
                    "No problem, we'll skip mutual funds. Shall I start your KYC \
                     verification now? (yes/no)",
                ))
            }
            None => Ok(self.retry_prompt(
                session,
                "Please reply yes or no: would you like to pledge mutual-fund \
                 holdings?",
            )),
        }
    }

    async fn collect_pan(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        let pan = match input::parse_pan(input) {
            Ok(p) => p,
            Err(e) => return Ok(self.retry_prompt(session, format!("{e}."))),
        };
        session.user_info.pan = Some(pan.clone());

        if session.ledger.open_reference(LedgerStep::MfFetch).is_some() {
            advance(session, OnboardingStep::MfFetchOtp);
            return Ok(StepOutcome::new(
                session,
                "A portfolio fetch is already in progress. Please reply with the \
                 OTP sent by your fund registrar.",
            ));
        }

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "pan": pan,
                "mobile": session.user_info.mobile,
            }),
        };
        match self
            .initiate(OperationClass::Api, LedgerStep::MfFetch, request)
            .await
        {
            Ok(response) => {
                session.ledger.record_initiation(
                    LedgerStep::MfFetch,
                    response.utility_reference_id,
                    response.web_url,
                )?;
                advance(session, OnboardingStep::MfFetchOtp);
                Ok(StepOutcome::new(
                    session,
                    "I've requested your portfolio from the registrar. Please \
                     reply with the OTP they sent to your registered mobile.",
                ))
            }
            Err(e) => self.provider_failure(
                session,
                e,
                "I couldn't reach the fund registrar just now. Please resend \
                 your PAN in a moment.",
            ),
        }
    }

    async fn mf_fetch_otp(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        let otp = match input::parse_otp(input) {
            Ok(o) => o,
            Err(e) => return Ok(self.retry_prompt(session, format!("{e}."))),
        };
        let Some(reference) = session
            .ledger
            .open_reference(LedgerStep::MfFetch)
            .map(|r| r.reference_id.clone())
        else {
            return Ok(self.retry_prompt(
                session,
                "There's no portfolio fetch in progress. Please share your PAN \
                 again.",
            ));
        };

        let response = match self
            .confirm(
                OperationClass::Verification,
                LedgerStep::MfFetch,
                &reference,
                json!({ "otp": otp }),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return self.provider_failure(
                    session,
                    e,
                    "OTP validation failed. Please check the code and try again.",
                );
            }
        };

        let accepted = response.status.is_accepted_for(LedgerStep::MfFetch);
        if accepted {
            if let Some(holdings) = response
                .details
                .as_ref()
                .and_then(|d| d.get("holdings"))
                .cloned()
            {
                match serde_json::from_value(holdings) {
                    Ok(portfolio) => session.mutual_funds.portfolio = portfolio,
                    Err(e) => tracing::warn!(error = %e, "Unparseable holdings in fetch response"),
                }
            }
        }
        session.ledger.record_status(
            LedgerStep::MfFetch,
            response.status,
            response.sub_status,
            response.details,
        )?;

        if accepted {
            advance(session, OnboardingStep::ShowMfDetails);
            let count = session.mutual_funds.portfolio.len();
            Ok(StepOutcome::new(
                session,
                format!("OTP verified. I found {count} holding(s) in your portfolio."),
            ))
        } else {
            Ok(self.retry_prompt(
                session,
                "That OTP wasn't accepted by the registrar. Please try again.",
            ))
        }
    }

    fn show_mf_details(&self, session: &mut Session) -> Result<StepOutcome> {
        let pledgeable = session.mutual_funds.pledgeable_value();
        let lines: Vec<String> = session
            .mutual_funds
            .portfolio
            .iter()
            .filter(|h| h.available_for_pledge)
            .map(|h| format!("- {} (₹{})", h.scheme_name, h.current_value))
            .collect();
        // Nothing to pledge: leave the branch rather than asking for an
        // amount no input could satisfy.
        if lines.is_empty() || pledgeable <= Decimal::ZERO {
            session.mutual_funds.branch_taken = false;
            advance(session, OnboardingStep::AskKycConsent);
            return Ok(StepOutcome::new(
                session,
                "None of your holdings are eligible for pledging right now, so \
                 we'll continue without mutual funds. Shall I start your KYC \
                 verification? (yes/no)",
            ));
        }
        advance(session, OnboardingStep::CollectPledgeAmount);
        Ok(StepOutcome::new(
            session,
            format!(
                "Here are your pledge-eligible holdings:\n{}\nYou can pledge up \
                 to ₹{pledgeable}. How much would you like to pledge?",
                lines.join("\n")
            ),
        )
        .with_data(json!({ "pledgeableValue": pledgeable })))
    }

    fn collect_pledge_amount(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        let amount = match input::parse_amount(input) {
            Ok(a) => a,
            Err(e) => return Ok(self.retry_prompt(session, format!("{e}."))),
        };
        let ceiling = session.mutual_funds.pledgeable_value();
        if amount > ceiling {
            return Ok(self.retry_prompt(
                session,
                format!(
                    "₹{amount} is more than your pledgeable value of ₹{ceiling}. \
                     Please choose an amount up to ₹{ceiling}."
                ),
            ));
        }
        session.mutual_funds.pledge_amount = Some(amount);
        advance(session, OnboardingStep::ConfirmPledge);
        Ok(StepOutcome::new(
            session,
            format!("You'd like to pledge ₹{amount}. Shall I proceed? (yes/no)"),
        ))
    }

    async fn confirm_pledge(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        match input::parse_yes_no(input) {
            Some(true) => {}
            Some(false) => {
                session.mutual_funds.pledge_amount = None;
                advance(session, OnboardingStep::CollectPledgeAmount);
                return Ok(StepOutcome::new(
                    session,
                    "Okay, let's pick a different amount. How much would you like \
                     to pledge?",
                ));
            }
            None => {
                return Ok(self.retry_prompt(
                    session,
                    "Please reply yes to proceed with the pledge, or no to change \
                     the amount.",
                ));
            }
        }

        if session.ledger.open_reference(LedgerStep::MfPledge).is_some() {
            advance(session, OnboardingStep::MfPledgeOtp);
            return Ok(StepOutcome::new(
                session,
                "A pledge is already in progress. Please reply with the OTP from \
                 your registrar.",
            ));
        }

        let amount = session.mutual_funds.pledge_amount.unwrap_or(Decimal::ZERO);
        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({ "pledgeAmount": amount }),
        };
        match self
            .initiate(OperationClass::Api, LedgerStep::MfPledge, request)
            .await
        {
            Ok(response) => {
                session.ledger.record_initiation(
                    LedgerStep::MfPledge,
                    response.utility_reference_id,
                    response.web_url,
                )?;
                advance(session, OnboardingStep::MfPledgeOtp);
                Ok(StepOutcome::new(
                    session,
                    "Pledge initiated. Please reply with the OTP sent by your \
                     registrar to authorize it.",
                ))
            }
            Err(e) => self.provider_failure(
                session,
                e,
                "I couldn't initiate the pledge just now. Please say yes to try \
                 again.",
            ),
        }
    }

    async fn mf_pledge_otp(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        let otp = match input::parse_otp(input) {
            Ok(o) => o,
            Err(e) => return Ok(self.retry_prompt(session, format!("{e}."))),
        };
        let Some(reference) = session
            .ledger
            .open_reference(LedgerStep::MfPledge)
            .map(|r| r.reference_id.clone())
        else {
            return Ok(self.retry_prompt(
                session,
                "There's no pledge awaiting authorization. Please confirm the \
                 pledge amount first.",
            ));
        };

        let response = match self
            .confirm(
                OperationClass::Verification,
                LedgerStep::MfPledge,
                &reference,
                json!({ "otp": otp }),
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return self.provider_failure(
                    session,
                    e,
                    "Pledge authorization failed. Please check the OTP and try \
                     again.",
                );
            }
        };

        let accepted = response.status.is_accepted_for(LedgerStep::MfPledge);
        session.ledger.record_status(
            LedgerStep::MfPledge,
            response.status,
            response.sub_status,
            response.details,
        )?;

        if accepted {
            advance(session, OnboardingStep::AskKycConsent);
            Ok(StepOutcome::new(
                session,
                "Your pledge is confirmed. Next up is KYC verification. Shall I \
                 start it? (yes/no)",
            ))
        } else {
            Ok(self.retry_prompt(
                session,
                "That OTP wasn't accepted. Please try again.",
            ))
        }
    }

    async fn ask_kyc_consent(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        match input::parse_yes_no(input) {
            Some(true) => {
                advance(session, OnboardingStep::InitiateKyc);
                self.initiate_kyc(session).await
            }
            Some(false) => Ok(self.retry_prompt(
                session,
                "KYC verification is required to open your loan account. Let me \
                 know when you're ready to proceed.",
            )),
            None => Ok(self.retry_prompt(
                session,
                "Please reply yes when you're ready to start KYC verification.",
            )),
        }
    }

    async fn initiate_kyc(&self, session: &mut Session) -> Result<StepOutcome> {
        if let Some(open) = session.ledger.open_reference(LedgerStep::Kyc) {
            let url = open.web_url.clone();
            advance(session, OnboardingStep::VerifyKyc);
            return Ok(StepOutcome::new(
                session,
                match &url {
                    Some(u) => format!("Your KYC is already in progress. Complete it here: {u}"),
                    None => "Your KYC is already in progress.".to_string(),
                },
            ));
        }

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "verificationType": "KYC",
                "pan": session.user_info.pan,
                "mobile": session.user_info.mobile,
            }),
        };
        match self
            .initiate(OperationClass::Api, LedgerStep::Kyc, request)
            .await
        {
            Ok(response) => {
                let url = response.web_url.clone();
                session.ledger.record_initiation(
                    LedgerStep::Kyc,
                    response.utility_reference_id,
                    response.web_url,
                )?;
                advance(session, OnboardingStep::VerifyKyc);
                let message = match &url {
                    Some(u) => format!(
                        "KYC started. Please complete it here: {u}\nSend me a \
                         message once you're done."
                    ),
                    None => "KYC started. Send me a message once you're done.".to_string(),
                };
                let mut outcome = StepOutcome::new(session, message);
                if let Some(u) = url {
                    outcome = outcome.with_data(json!({ "kycUrl": u }));
                }
                Ok(outcome)
            }
            Err(e) => self.provider_failure(
                session,
                e,
                "I couldn't start KYC just now. Please say yes to try again.",
            ),
        }
    }

    async fn verify_kyc(&self, session: &mut Session) -> Result<StepOutcome> {
        self.verify_utility(
            session,
            LedgerStep::Kyc,
            OnboardingStep::HandleKycDeviation,
            OnboardingStep::CollectBankDetails,
            "Your KYC is approved! Now please share your bank account number \
             and IFSC code.",
            "There's a mismatch in your KYC details that needs a supporting \
             document. Which can you provide: passport, driving licence, or \
             election card?",
        )
        .await
    }

    async fn collect_bank_details(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        let details = match input::parse_bank_details(input) {
            Ok(d) => d,
            Err(e) => {
                return Ok(self.retry_prompt(
                    session,
                    format!(
                        "{e}. Please share both, for example: \"account \
                         123456789012, IFSC HDFC0001234\"."
                    ),
                ));
            }
        };

        if session
            .ledger
            .open_reference(LedgerStep::BankAccount)
            .is_some()
        {
            advance(session, OnboardingStep::VerifyBank);
            return self.verify_bank(session).await;
        }

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "accountNumber": details.account_number,
                "ifscCode": details.ifsc_code,
                "accountType": "SAVINGS_ACCOUNT",
            }),
        };
        match self
            .initiate(OperationClass::Api, LedgerStep::BankAccount, request)
            .await
        {
            Ok(response) => {
                session.ledger.record_initiation(
                    LedgerStep::BankAccount,
                    response.utility_reference_id,
                    response.web_url,
                )?;
                advance(session, OnboardingStep::VerifyBank);
                Ok(StepOutcome::new(
                    session,
                    "Thanks, I'm verifying your bank account. Send me a message \
                     in a moment to check the result.",
                ))
            }
            Err(e) => self.provider_failure(
                session,
                e,
                "Bank verification couldn't be started. Please share your \
                 account number and IFSC again.",
            ),
        }
    }

    async fn verify_bank(&self, session: &mut Session) -> Result<StepOutcome> {
        let outcome = self
            .verify_utility(
                session,
                LedgerStep::BankAccount,
                OnboardingStep::HandleBankDeviation,
                OnboardingStep::SetupMandate,
                "Your bank account is verified.",
                "The account holder name doesn't match your KYC records. Which \
                 document can you provide: cancelled cheque, passbook, or bank \
                 statement?",
            )
            .await?;
        if session.current_step == OnboardingStep::SetupMandate {
            return self.setup_mandate(session).await;
        }
        Ok(outcome)
    }

    /// Shared poll-and-branch for the KYC and bank verification states.
    async fn verify_utility(
        &self,
        session: &mut Session,
        step: LedgerStep,
        deviation_state: OnboardingStep,
        success_state: OnboardingStep,
        success_message: &str,
        deviation_message: &str,
    ) -> Result<StepOutcome> {
        let Some(reference) = session
            .ledger
            .get(step)
            .map(|r| r.reference_id.clone())
        else {
            return Ok(self.retry_prompt(session, "I can't find that verification. Let's restart it."));
        };

        let response = match self.poll(step, &reference).await {
            Ok(r) => r,
            Err(e) => {
                return self.provider_failure(
                    session,
                    e,
                    "I couldn't check the verification status just now. Please \
                     try again shortly.",
                );
            }
        };

        let deviation = response.reports_deviation();
        let status = response.status;
        session
            .ledger
            .record_status(step, response.status, response.sub_status, response.details)?;

        if deviation && !status.is_accepted_for(step) {
            advance(session, deviation_state);
            Ok(StepOutcome::new(session, deviation_message))
        } else if session.ledger.is_accepted(step) {
            advance(session, success_state);
            Ok(StepOutcome::new(session, success_message))
        } else if status.is_terminal() {
            Ok(self.retry_prompt(
                session,
                format!(
                    "The verification came back {status}. We'll need to start it \
                     over. Send me a message to retry."
                ),
            ))
        } else {
            Ok(self.retry_prompt(
                session,
                "It's still being processed. Give it a moment and message me \
                 again.",
            ))
        }
    }

    async fn handle_deviation(
        &self,
        session: &mut Session,
        input: &str,
        step: LedgerStep,
    ) -> Result<StepOutcome> {
        let required_utility = match step {
            LedgerStep::BankAccount => "BANK_VERIFICATION",
            _ => "PHOTO_VERIFICATION",
        };
        let Some(document_type) = input::parse_document_type(input) else {
            return Ok(self.retry_prompt(
                session,
                "I didn't recognize that document. Please name one of the \
                 accepted types.",
            ));
        };
        if document_type.utility_type() != required_utility {
            return Ok(self.retry_prompt(
                session,
                format!("A {document_type:?} document can't resolve this mismatch. Please pick one of the accepted types."),
            ));
        }

        let Some(record) = session.ledger.get(step) else {
            return Ok(self.retry_prompt(session, "I can't find that verification. Let's restart it."));
        };
        let reason = record
            .details
            .as_ref()
            .and_then(|d| d.get("deviationDetails"))
            .and_then(|d| d.get("reason"))
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .unwrap_or(DeviationReason::NameMismatch);
        let request = DeviationRequest {
            utility_reference_id: record.reference_id.clone(),
            deviation_reason: reason,
            remarks: Some(format!("Customer provided {document_type:?} over chat")),
            documents: vec![DeviationDocument::from_bytes(
                document_type,
                input.as_bytes(),
                "text/plain",
            )],
        };

        let response = match self.resolve_deviation(step, request).await {
            Ok(r) => r,
            Err(e) => {
                return self.provider_failure(
                    session,
                    e,
                    "I couldn't submit the document for review. Please try again.",
                );
            }
        };
        session
            .ledger
            .record_status(step, response.status, response.sub_status, response.details)?;

        let back_to = match step {
            LedgerStep::BankAccount => OnboardingStep::VerifyBank,
            _ => OnboardingStep::VerifyKyc,
        };
        advance(session, back_to);
        Ok(StepOutcome::new(
            session,
            "Thanks, the document is with our review team. Message me in a \
             while to check the status.",
        ))
    }

    async fn setup_mandate(&self, session: &mut Session) -> Result<StepOutcome> {
        if let Some(open) = session.ledger.open_reference(LedgerStep::Mandate) {
            let url = open.web_url.clone();
            advance(session, OnboardingStep::VerifyMandate);
            return Ok(StepOutcome::new(
                session,
                match url {
                    Some(u) => format!("Your mandate is already set up. Authorize it here: {u}"),
                    None => "Your mandate setup is already in progress.".to_string(),
                },
            ));
        }

        let bank_reference = session
            .ledger
            .get(LedgerStep::BankAccount)
            .map(|r| r.reference_id.clone())
            .unwrap_or_default();
        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "bankAccountVerificationId": bank_reference,
                "mandateType": "API_MANDATE",
                "mandateFrequency": "ADHOC",
                "mandateAmount": session.mutual_funds.pledge_amount,
            }),
        };
        match self
            .initiate(OperationClass::Api, LedgerStep::Mandate, request)
            .await
        {
            Ok(response) => {
                let url = response.web_url.clone();
                session.ledger.record_initiation(
                    LedgerStep::Mandate,
                    response.utility_reference_id,
                    response.web_url,
                )?;
                advance(session, OnboardingStep::VerifyMandate);
                Ok(StepOutcome::new(
                    session,
                    match url {
                        Some(u) => format!(
                            "Next, authorize the repayment mandate here: {u}\nMessage \
                             me once you've done that."
                        ),
                        None => "Mandate setup started. Message me once you've \
                                 authorized it."
                            .to_string(),
                    },
                ))
            }
            Err(e) => self.provider_failure(
                session,
                e,
                "Mandate setup failed. Message me to try again.",
            ),
        }
    }

    async fn verify_mandate(&self, session: &mut Session) -> Result<StepOutcome> {
        let Some(reference) = session
            .ledger
            .get(LedgerStep::Mandate)
            .map(|r| r.reference_id.clone())
        else {
            advance(session, OnboardingStep::SetupMandate);
            return self.setup_mandate(session).await;
        };

        let response = match self.poll(LedgerStep::Mandate, &reference).await {
            Ok(r) => r,
            Err(e) => {
                return self.provider_failure(
                    session,
                    e,
                    "I couldn't check the mandate status. Please try again shortly.",
                );
            }
        };
        session.ledger.record_status(
            LedgerStep::Mandate,
            response.status,
            response.sub_status,
            response.details,
        )?;

        if session.ledger.is_accepted(LedgerStep::Mandate) {
            advance(session, OnboardingStep::SetupAgreement);
            self.setup_agreement(session).await
        } else {
            Ok(self.retry_prompt(
                session,
                "The mandate isn't authorized yet. Complete the authorization \
                 and message me again.",
            ))
        }
    }

    async fn setup_agreement(&self, session: &mut Session) -> Result<StepOutcome> {
        if let Some(open) = session.ledger.open_reference(LedgerStep::Agreement) {
            let url = open.web_url.clone();
            advance(session, OnboardingStep::VerifyAgreement);
            return Ok(StepOutcome::new(
                session,
                match url {
                    Some(u) => format!("Your agreement is ready to sign here: {u}"),
                    None => "Your agreement is already being prepared.".to_string(),
                },
            ));
        }

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "kycReferenceId": session.ledger.get(LedgerStep::Kyc).map(|r| r.reference_id.clone()),
                "bankAccountReferenceId": session.ledger.get(LedgerStep::BankAccount).map(|r| r.reference_id.clone()),
            }),
        };
        // One contract call produces both the agreement and the key-facts
        // statement, each with its own reference.
        match self
            .initiate(OperationClass::Api, LedgerStep::Agreement, request)
            .await
        {
            Ok(response) => {
                let kfs_reference = response
                    .details
                    .as_ref()
                    .and_then(|d| d.get("kfsReferenceId"))
                    .and_then(Value::as_str)
                    .unwrap_or(&response.utility_reference_id)
                    .to_string();
                let url = response.web_url.clone();
                session.ledger.record_initiation(
                    LedgerStep::Agreement,
                    response.utility_reference_id,
                    response.web_url,
                )?;
                session
                    .ledger
                    .record_initiation(LedgerStep::Kfs, kfs_reference, None)?;
                advance(session, OnboardingStep::VerifyAgreement);
                Ok(StepOutcome::new(
                    session,
                    match url {
                        Some(u) => format!(
                            "Almost there! Please review and sign your loan \
                             agreement and key-facts statement here: {u}"
                        ),
                        None => "Your loan agreement is being prepared. Message me \
                                 shortly to check on it."
                            .to_string(),
                    },
                ))
            }
            Err(e) => self.provider_failure(
                session,
                e,
                "I couldn't prepare the agreement. Message me to try again.",
            ),
        }
    }

    async fn verify_agreement(&self, session: &mut Session) -> Result<StepOutcome> {
        let (Some(agreement_ref), Some(kfs_ref)) = (
            session
                .ledger
                .get(LedgerStep::Agreement)
                .map(|r| r.reference_id.clone()),
            session
                .ledger
                .get(LedgerStep::Kfs)
                .map(|r| r.reference_id.clone()),
        ) else {
            advance(session, OnboardingStep::SetupAgreement);
            return self.setup_agreement(session).await;
        };

        let (agreement, kfs) = futures::future::join(
            self.poll(LedgerStep::Agreement, &agreement_ref),
            self.poll(LedgerStep::Kfs, &kfs_ref),
        )
        .await;
        let (agreement, kfs) = match (agreement, kfs) {
            (Ok(a), Ok(k)) => (a, k),
            (agreement, kfs) => {
                let error = agreement.err().or(kfs.err()).unwrap_or_else(|| {
                    ProviderError::InvalidResponse("missing response".into())
                });
                return self.provider_failure(
                    session,
                    error,
                    "I couldn't check the agreement status. Please try again \
                     shortly.",
                );
            }
        };

        session.ledger.record_status(
            LedgerStep::Agreement,
            agreement.status,
            agreement.sub_status,
            agreement.details,
        )?;
        session
            .ledger
            .record_status(LedgerStep::Kfs, kfs.status, kfs.sub_status, kfs.details)?;

        if session.ledger.is_accepted(LedgerStep::Agreement)
            && session.ledger.is_accepted(LedgerStep::Kfs)
        {
            advance(session, OnboardingStep::CreateLoan);
            Ok(StepOutcome::new(
                session,
                "Everything is signed. Reply yes and I'll submit your loan \
                 application.",
            ))
        } else {
            Ok(self.retry_prompt(
                session,
                "The agreement isn't fully signed yet. Finish signing and \
                 message me again.",
            ))
        }
    }

    async fn create_loan(&self, session: &mut Session, input: &str) -> Result<StepOutcome> {
        if input::parse_yes_no(input) != Some(true) {
            return Ok(self.retry_prompt(
                session,
                "Reply yes when you're ready and I'll submit your application.",
            ));
        }
        loan_prerequisites(session)?;

        let mut submitted: Vec<Value> = Vec::new();
        let mut push = |data_type: &str, step: LedgerStep, ledger: &crate::session::ledger::ReferenceLedger| {
            if let Some(record) = ledger.get(step) {
                submitted.push(json!({
                    "dataType": data_type,
                    "referenceId": record.reference_id,
                }));
            }
        };
        push("MOBILE_VERIFICATION_LOG", LedgerStep::Mobile, &session.ledger);
        push("EMAIL_VERIFICATION_LOG", LedgerStep::Email, &session.ledger);
        push("KYC", LedgerStep::Kyc, &session.ledger);
        push("BANK_ACCOUNT", LedgerStep::BankAccount, &session.ledger);
        push("MANDATE", LedgerStep::Mandate, &session.ledger);
        push("AGREEMENT", LedgerStep::Agreement, &session.ledger);
        push("KFS", LedgerStep::Kfs, &session.ledger);
        if session.mutual_funds.branch_taken {
            push("MF_PLEDGE", LedgerStep::MfPledge, &session.ledger);
        }

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({ "submittedDataList": submitted }),
        };
        match self
            .initiate(OperationClass::Api, LedgerStep::LoanAccount, request)
            .await
        {
            Ok(response) => {
                let loan_account_id = response
                    .details
                    .as_ref()
                    .and_then(|d| d.get("fenixLoanAccountId"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                session.ledger.record_initiation(
                    LedgerStep::LoanAccount,
                    response.utility_reference_id,
                    response.web_url,
                )?;
                session.ledger.record_status(
                    LedgerStep::LoanAccount,
                    response.status,
                    response.sub_status,
                    response.details,
                )?;
                advance(session, OnboardingStep::Done);
                let message = match &loan_account_id {
                    Some(id) => format!(
                        "Congratulations! Your loan account {id} has been created. \
                         You're all set."
                    ),
                    None => "Congratulations! Your loan application has been \
                             submitted. You're all set."
                        .to_string(),
                };
                let mut outcome = StepOutcome::new(session, message);
                if let Some(id) = loan_account_id {
                    outcome = outcome.with_data(json!({ "loanAccountId": id }));
                }
                Ok(outcome)
            }
            Err(e) => self.provider_failure(
                session,
                e,
                "Submission didn't go through. Reply yes to try again.",
            ),
        }
    }

    // --- provider plumbing ---------------------------------------------

    async fn initiate(
        &self,
        class: OperationClass,
        step: LedgerStep,
        request: InitiateRequest,
    ) -> std::result::Result<UtilityResponse, ProviderError> {
        self.retry
            .execute(class, || self.provider.initiate(step, request.clone()))
            .await
    }

    async fn poll(
        &self,
        step: LedgerStep,
        reference_id: &str,
    ) -> std::result::Result<UtilityResponse, ProviderError> {
        self.retry
            .execute(OperationClass::Verification, || {
                self.provider.status(step, reference_id)
            })
            .await
    }

    async fn confirm(
        &self,
        class: OperationClass,
        step: LedgerStep,
        reference_id: &str,
        params: Value,
    ) -> std::result::Result<UtilityResponse, ProviderError> {
        self.retry
            .execute(class, || {
                self.provider.confirm(step, reference_id, params.clone())
            })
            .await
    }

    async fn resolve_deviation(
        &self,
        step: LedgerStep,
        request: DeviationRequest,
    ) -> std::result::Result<UtilityResponse, ProviderError> {
        self.retry
            .execute(OperationClass::Upload, || {
                self.provider.resolve_deviation(step, request.clone())
            })
            .await
    }

    // --- failure folding -----------------------------------------------

    /// Re-enter the current step with the failure counter bumped.
    fn retry_prompt(&self, session: &mut Session, message: impl Into<String>) -> StepOutcome {
        let attempts = session.record_failure(session.current_step);
        tracing::debug!(
            user = %session.user_id,
            step = %session.current_step,
            attempts,
            "Step re-entered"
        );
        StepOutcome::new(session, message)
    }

    /// Fold a provider error into a re-prompt, except authentication
    /// failures, which are configuration problems and abort the turn.
    fn provider_failure(
        &self,
        session: &mut Session,
        error: ProviderError,
        message: &str,
    ) -> Result<StepOutcome> {
        if let ProviderError::Auth(_) = error {
            return Err(Error::Provider(error));
        }
        tracing::warn!(
            user = %session.user_id,
            step = %session.current_step,
            error = %error,
            "Provider call failed"
        );
        Ok(self.retry_prompt(session, message))
    }
}

/// Advance the session along the step graph. Transitions outside the
/// successor table are refused and logged, never applied.
fn advance(session: &mut Session, target: OnboardingStep) {
    if !session.current_step.can_transition_to(target) {
        tracing::error!(
            user = %session.user_id,
            from = %session.current_step,
            to = %target,
            "Refused step transition outside the graph"
        );
        return;
    }
    if session.current_step != target {
        session.reset_failures(session.current_step);
        tracing::info!(
            user = %session.user_id,
            from = %session.current_step,
            to = %target,
            "Step transition"
        );
        session.current_step = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ledger::StepStatus;

    fn accepted(session: &mut Session, step: LedgerStep, reference: &str) {
        session
            .ledger
            .record_initiation(step, reference, None)
            .unwrap();
        session
            .ledger
            .record_status(step, StepStatus::Approved, None, None)
            .unwrap();
    }

    #[test]
    fn prerequisites_list_every_unsatisfied_step() {
        let mut session = Session::new("u1");
        accepted(&mut session, LedgerStep::Mobile, "m1");
        accepted(&mut session, LedgerStep::Email, "e1");
        accepted(&mut session, LedgerStep::Kyc, "k1");
        // Bank initiated but still pending
        session
            .ledger
            .record_initiation(LedgerStep::BankAccount, "b1", None)
            .unwrap();

        let err = loan_prerequisites(&session).unwrap_err();
        assert_eq!(
            err.missing,
            vec!["bankAccount", "mandate", "agreement", "kfs"]
        );
    }

    #[test]
    fn pledge_reference_required_only_on_mf_branch() {
        let mut session = Session::new("u1");
        for (step, reference) in [
            (LedgerStep::Mobile, "m1"),
            (LedgerStep::Email, "e1"),
            (LedgerStep::Kyc, "k1"),
            (LedgerStep::BankAccount, "b1"),
            (LedgerStep::Mandate, "n1"),
            (LedgerStep::Agreement, "a1"),
            (LedgerStep::Kfs, "f1"),
        ] {
            accepted(&mut session, step, reference);
        }
        assert!(loan_prerequisites(&session).is_ok());

        session.mutual_funds.branch_taken = true;
        let err = loan_prerequisites(&session).unwrap_err();
        assert_eq!(err.missing, vec!["mfPledge"]);

        accepted(&mut session, LedgerStep::MfPledge, "p1");
        assert!(loan_prerequisites(&session).is_ok());
    }

    #[test]
    fn advance_refuses_transitions_outside_the_graph() {
        let mut session = Session::new("u1");
        session.current_step = OnboardingStep::CollectContact;
        advance(&mut session, OnboardingStep::CreateLoan);
        assert_eq!(session.current_step, OnboardingStep::CollectContact);

        advance(&mut session, OnboardingStep::VerifyContact);
        assert_eq!(session.current_step, OnboardingStep::VerifyContact);
    }

    #[test]
    fn advance_clears_the_departing_steps_failures() {
        let mut session = Session::new("u1");
        session.current_step = OnboardingStep::CollectContact;
        session.record_failure(OnboardingStep::CollectContact);
        session.record_failure(OnboardingStep::CollectContact);

        advance(&mut session, OnboardingStep::VerifyContact);
        assert_eq!(session.failures(OnboardingStep::CollectContact), 0);
    }
}
