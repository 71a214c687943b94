//! Action router — executes catalog actions against the provider and
//! folds results into session state.
//!
//! Execution order per action: schema validation (fails fast, never
//! retried), ledger conflict check, provider call under the retry
//! executor, then ledger/session fold.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::error::{Error, ProviderError, Result, ValidationError};
use crate::flow::engine::loan_prerequisites;
use crate::flow::input;
use crate::provider::{
    DeviationDocument, DeviationReason, DeviationRequest, DocumentType, InitiateRequest,
    UtilityResponse, VerificationProvider,
};
use crate::retry::{OperationClass, RetryExecutor};
use crate::session::ledger::LedgerStep;
use crate::session::model::Session;

use super::catalog;

/// The result of one dispatched action. Failures keep the same envelope,
/// with `success` cleared and the failure class in `error`.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    /// Failure class tag: `AUTHENTICATION_ERROR`, `API_ERROR`, or
    /// `EXECUTION_ERROR`. Empty on success.
    pub error: Option<String>,
    pub data: Option<Value>,
}

impl ActionOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            data: None,
        }
    }

    fn failure(error: &Error) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error: Some(error_class(error).to_string()),
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn from_response(message: impl Into<String>, response: &UtilityResponse) -> Self {
        Self::ok(message).with_data(json!({
            "utilityReferenceId": response.utility_reference_id,
            "status": response.status,
            "subStatus": response.sub_status,
            "webUrl": response.web_url,
        }))
    }
}

pub struct ActionRouter {
    provider: Arc<dyn VerificationProvider>,
    retry: RetryExecutor,
}

impl ActionRouter {
    pub fn new(provider: Arc<dyn VerificationProvider>, retry: RetryExecutor) -> Self {
        Self { provider, retry }
    }

    /// Execute one action by name.
    ///
    /// Unknown action names are an error; execution failures of known
    /// actions are folded into a failure envelope so the caller always
    /// gets an [`ActionOutcome`] back.
    pub async fn dispatch(
        &self,
        name: &str,
        params: Value,
        session: &mut Session,
    ) -> Result<ActionOutcome> {
        if !catalog::is_known(name) {
            return Err(Error::UnknownAction {
                name: name.to_string(),
            });
        }
        tracing::info!(user = %session.user_id, action = %name, "Dispatching action");

        match self.run(name, params, session).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(user = %session.user_id, action = %name, error = %e, "Action failed");
                Ok(ActionOutcome::failure(&e))
            }
        }
    }

    async fn run(&self, name: &str, params: Value, session: &mut Session) -> Result<ActionOutcome> {
        match name {
            "initiate_kyc" => self.initiate_kyc(session).await,
            "get_kyc_status" => self.status_check(session, LedgerStep::Kyc).await,
            "handle_kyc_deviation" => {
                self.handle_deviation(session, LedgerStep::Kyc, &params).await
            }
            "initiate_bank_verification" => {
                self.initiate_bank_verification(session, &params).await
            }
            "get_bank_verification_status" => {
                self.status_check(session, LedgerStep::BankAccount).await
            }
            "handle_bank_deviation" => {
                self.handle_deviation(session, LedgerStep::BankAccount, &params)
                    .await
            }
            "send_mf_fetch_otp" => self.send_mf_fetch_otp(session, &params).await,
            "validate_mf_fetch_otp" => self.validate_mf_fetch_otp(session, &params).await,
            "get_mf_portfolio" => self.get_mf_portfolio(session).await,
            "send_mf_pledge_otp" => self.send_mf_pledge_otp(session, &params).await,
            "validate_mf_pledge_otp" => self.validate_mf_pledge_otp(session, &params).await,
            "get_mf_pledge_details" => self.status_check(session, LedgerStep::MfPledge).await,
            "setup_mandate" => self.setup_mandate(session).await,
            "get_mandate_status" => self.status_check(session, LedgerStep::Mandate).await,
            "setup_agreement" => self.setup_agreement(session).await,
            "get_agreement_status" => self.get_agreement_status(session).await,
            "create_loan_account" => self.create_loan_account(session).await,
            // is_known() gates everything above
            other => Err(Error::UnknownAction {
                name: other.to_string(),
            }),
        }
    }

    // --- actions -------------------------------------------------------

    async fn initiate_kyc(&self, session: &mut Session) -> Result<ActionOutcome> {
        check_no_open_reference(session, LedgerStep::Kyc)?;
        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "verificationType": "KYC",
                "pan": session.user_info.pan,
                "mobile": session.user_info.mobile,
            }),
        };
        let response = self
            .initiate(OperationClass::Api, LedgerStep::Kyc, request)
            .await?;
        session.ledger.record_initiation(
            LedgerStep::Kyc,
            response.utility_reference_id.clone(),
            response.web_url.clone(),
        )?;
        Ok(ActionOutcome::from_response("KYC verification started", &response))
    }

    async fn initiate_bank_verification(
        &self,
        session: &mut Session,
        params: &Value,
    ) -> Result<ActionOutcome> {
        let account_number = require_str(params, "accountNumber")?;
        let ifsc_code = require_str(params, "ifscCode")?;
        let account_type = require_str(params, "accountType")?;
        input::validate_account_number(&account_number)?;
        input::validate_ifsc(&ifsc_code)?;
        require_enum(
            "accountType",
            &account_type,
            &["SAVINGS_ACCOUNT", "CURRENT_ACCOUNT"],
        )?;
        check_no_open_reference(session, LedgerStep::BankAccount)?;

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "accountNumber": account_number,
                "ifscCode": ifsc_code.to_uppercase(),
                "accountType": account_type,
            }),
        };
        let response = self
            .initiate(OperationClass::Api, LedgerStep::BankAccount, request)
            .await?;
        session.ledger.record_initiation(
            LedgerStep::BankAccount,
            response.utility_reference_id.clone(),
            response.web_url.clone(),
        )?;
        Ok(ActionOutcome::from_response(
            "Bank account verification started",
            &response,
        ))
    }

    async fn handle_deviation(
        &self,
        session: &mut Session,
        step: LedgerStep,
        params: &Value,
    ) -> Result<ActionOutcome> {
        let document_type_raw = require_str(params, "documentType")?;
        let document_base64 = require_str(params, "documentBase64")?;
        let mime_type = require_str(params, "mimeType")?;
        let document_type: DocumentType =
            serde_json::from_value(json!(document_type_raw)).map_err(|_| {
                Error::Validation(ValidationError::InvalidValue {
                    field: "documentType".into(),
                    message: format!("'{document_type_raw}' is not a supported document type"),
                })
            })?;
        let required_utility = match step {
            LedgerStep::BankAccount => "BANK_VERIFICATION",
            _ => "PHOTO_VERIFICATION",
        };
        if document_type.utility_type() != required_utility {
            return Err(Error::Validation(ValidationError::InvalidValue {
                field: "documentType".into(),
                message: format!("{document_type_raw} cannot resolve a {step} deviation"),
            }));
        }

        let Some(record) = session.ledger.get(step) else {
            return Err(Error::Precondition(crate::error::PreconditionError {
                missing: vec![step.to_string()],
            }));
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
            remarks: params
                .get("remarks")
                .and_then(Value::as_str)
                .map(str::to_string),
            documents: vec![DeviationDocument {
                document_type,
                content_base64: document_base64,
                mime_type,
            }],
        };

        let response = self
            .retry
            .execute(OperationClass::Upload, || {
                self.provider.resolve_deviation(step, request.clone())
            })
            .await?;
        session.ledger.record_status(
            step,
            response.status,
            response.sub_status.clone(),
            response.details.clone(),
        )?;
        Ok(ActionOutcome::from_response(
            "Document submitted for review",
            &response,
        ))
    }

    async fn send_mf_fetch_otp(
        &self,
        session: &mut Session,
        params: &Value,
    ) -> Result<ActionOutcome> {
        let pan = require_str(params, "pan")?.to_uppercase();
        if input::parse_pan(&pan).ok().as_deref() != Some(pan.as_str()) {
            return Err(Error::Validation(ValidationError::InvalidFormat {
                field: "pan".into(),
                expected: "five letters, four digits, one letter".into(),
            }));
        }
        check_no_open_reference(session, LedgerStep::MfFetch)?;
        session.user_info.pan = Some(pan.clone());
        session.mutual_funds.branch_taken = true;

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({ "pan": pan, "mobile": session.user_info.mobile }),
        };
        let response = self
            .initiate(OperationClass::Api, LedgerStep::MfFetch, request)
            .await?;
        session.ledger.record_initiation(
            LedgerStep::MfFetch,
            response.utility_reference_id.clone(),
            response.web_url.clone(),
        )?;
        Ok(ActionOutcome::from_response(
            "Portfolio fetch OTP sent",
            &response,
        ))
    }

    async fn validate_mf_fetch_otp(
        &self,
        session: &mut Session,
        params: &Value,
    ) -> Result<ActionOutcome> {
        let otp = require_otp(params)?;
        let reference = open_reference(session, LedgerStep::MfFetch)?;
        let response = self
            .confirm(LedgerStep::MfFetch, &reference, json!({ "otp": otp }))
            .await?;

        if response.status.is_accepted_for(LedgerStep::MfFetch) {
            if let Some(holdings) = response
                .details
                .as_ref()
                .and_then(|d| d.get("holdings"))
                .cloned()
            {
                if let Ok(portfolio) = serde_json::from_value(holdings) {
                    session.mutual_funds.portfolio = portfolio;
                }
            }
        }
        session.ledger.record_status(
            LedgerStep::MfFetch,
            response.status,
            response.sub_status.clone(),
            response.details.clone(),
        )?;
        Ok(
            ActionOutcome::from_response("Portfolio fetch OTP validated", &response).with_data(
                json!({
                    "holdings": session.mutual_funds.portfolio,
                    "pledgeableValue": session.mutual_funds.pledgeable_value(),
                }),
            ),
        )
    }

    async fn get_mf_portfolio(&self, session: &mut Session) -> Result<ActionOutcome> {
        let reference = existing_reference(session, LedgerStep::MfFetch)?;
        let response = self.poll(LedgerStep::MfFetch, &reference).await?;
        if let Some(holdings) = response
            .details
            .as_ref()
            .and_then(|d| d.get("holdings"))
            .cloned()
        {
            if let Ok(portfolio) = serde_json::from_value(holdings) {
                session.mutual_funds.portfolio = portfolio;
            }
        }
        session.ledger.record_status(
            LedgerStep::MfFetch,
            response.status,
            response.sub_status.clone(),
            response.details.clone(),
        )?;
        Ok(ActionOutcome::ok("Portfolio retrieved").with_data(json!({
            "holdings": session.mutual_funds.portfolio,
            "pledgeableValue": session.mutual_funds.pledgeable_value(),
        })))
    }

    async fn send_mf_pledge_otp(
        &self,
        session: &mut Session,
        params: &Value,
    ) -> Result<ActionOutcome> {
        let amount_raw = require_str(params, "amount")?;
        let amount: Decimal =
            amount_raw
                .replace(',', "")
                .parse()
                .map_err(|_| {
                    Error::Validation(ValidationError::InvalidValue {
                        field: "amount".into(),
                        message: format!("'{amount_raw}' is not a valid amount"),
                    })
                })?;
        let ceiling = session.mutual_funds.pledgeable_value();
        if amount <= Decimal::ZERO || amount > ceiling {
            return Err(Error::Validation(ValidationError::InvalidValue {
                field: "amount".into(),
                message: format!("amount must be between 0 and {ceiling}"),
            }));
        }
        check_no_open_reference(session, LedgerStep::MfPledge)?;
        session.mutual_funds.pledge_amount = Some(amount);
        session.mutual_funds.branch_taken = true;

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({ "pledgeAmount": amount }),
        };
        let response = self
            .initiate(OperationClass::Api, LedgerStep::MfPledge, request)
            .await?;
        session.ledger.record_initiation(
            LedgerStep::MfPledge,
            response.utility_reference_id.clone(),
            response.web_url.clone(),
        )?;
        Ok(ActionOutcome::from_response("Pledge OTP sent", &response))
    }

    async fn validate_mf_pledge_otp(
        &self,
        session: &mut Session,
        params: &Value,
    ) -> Result<ActionOutcome> {
        let otp = require_otp(params)?;
        let reference = open_reference(session, LedgerStep::MfPledge)?;
        let response = self
            .confirm(LedgerStep::MfPledge, &reference, json!({ "otp": otp }))
            .await?;
        session.ledger.record_status(
            LedgerStep::MfPledge,
            response.status,
            response.sub_status.clone(),
            response.details.clone(),
        )?;
        Ok(ActionOutcome::from_response("Pledge OTP validated", &response))
    }

    async fn setup_mandate(&self, session: &mut Session) -> Result<ActionOutcome> {
        check_no_open_reference(session, LedgerStep::Mandate)?;
        let bank_reference = existing_reference(session, LedgerStep::BankAccount)?;
        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "bankAccountVerificationId": bank_reference,
                "mandateType": "API_MANDATE",
                "mandateFrequency": "ADHOC",
                "mandateAmount": session.mutual_funds.pledge_amount,
            }),
        };
        let response = self
            .initiate(OperationClass::Api, LedgerStep::Mandate, request)
            .await?;
        session.ledger.record_initiation(
            LedgerStep::Mandate,
            response.utility_reference_id.clone(),
            response.web_url.clone(),
        )?;
        Ok(ActionOutcome::from_response("Mandate setup started", &response))
    }

    async fn setup_agreement(&self, session: &mut Session) -> Result<ActionOutcome> {
        check_no_open_reference(session, LedgerStep::Agreement)?;
        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({
                "kycReferenceId": session.ledger.get(LedgerStep::Kyc).map(|r| r.reference_id.clone()),
                "bankAccountReferenceId": session.ledger.get(LedgerStep::BankAccount).map(|r| r.reference_id.clone()),
            }),
        };
        let response = self
            .initiate(OperationClass::Api, LedgerStep::Agreement, request)
            .await?;
        let kfs_reference = response
            .details
            .as_ref()
            .and_then(|d| d.get("kfsReferenceId"))
            .and_then(Value::as_str)
            .unwrap_or(&response.utility_reference_id)
            .to_string();
        session.ledger.record_initiation(
            LedgerStep::Agreement,
            response.utility_reference_id.clone(),
            response.web_url.clone(),
        )?;
        session
            .ledger
            .record_initiation(LedgerStep::Kfs, kfs_reference, None)?;
        Ok(ActionOutcome::from_response(
            "Agreement and key-facts statement generated",
            &response,
        ))
    }

    async fn get_agreement_status(&self, session: &mut Session) -> Result<ActionOutcome> {
        let agreement_ref = existing_reference(session, LedgerStep::Agreement)?;
        let kfs_ref = existing_reference(session, LedgerStep::Kfs)?;
        let (agreement, kfs) = futures::future::join(
            self.poll(LedgerStep::Agreement, &agreement_ref),
            self.poll(LedgerStep::Kfs, &kfs_ref),
        )
        .await;
        let (agreement, kfs) = (agreement?, kfs?);
        session.ledger.record_status(
            LedgerStep::Agreement,
            agreement.status,
            agreement.sub_status.clone(),
            agreement.details.clone(),
        )?;
        session.ledger.record_status(
            LedgerStep::Kfs,
            kfs.status,
            kfs.sub_status,
            kfs.details,
        )?;
        Ok(ActionOutcome::ok("Agreement status retrieved").with_data(json!({
            "agreementStatus": agreement.status,
            "kfsStatus": kfs.status,
        })))
    }

    async fn create_loan_account(&self, session: &mut Session) -> Result<ActionOutcome> {
        loan_prerequisites(session)?;
        check_no_open_reference(session, LedgerStep::LoanAccount)?;

        let mut submitted: Vec<Value> = Vec::new();
        for (data_type, step) in [
            ("MOBILE_VERIFICATION_LOG", LedgerStep::Mobile),
            ("EMAIL_VERIFICATION_LOG", LedgerStep::Email),
            ("KYC", LedgerStep::Kyc),
            ("BANK_ACCOUNT", LedgerStep::BankAccount),
            ("MANDATE", LedgerStep::Mandate),
            ("AGREEMENT", LedgerStep::Agreement),
            ("KFS", LedgerStep::Kfs),
        ] {
            if let Some(record) = session.ledger.get(step) {
                submitted.push(json!({
                    "dataType": data_type,
                    "referenceId": record.reference_id,
                }));
            }
        }
        if session.mutual_funds.branch_taken {
            if let Some(record) = session.ledger.get(LedgerStep::MfPledge) {
                submitted.push(json!({
                    "dataType": "MF_PLEDGE",
                    "referenceId": record.reference_id,
                }));
            }
        }

        let request = InitiateRequest {
            opportunity_id: session.opportunity_id.clone().unwrap_or_default(),
            params: json!({ "submittedDataList": submitted }),
        };
        let response = self
            .initiate(OperationClass::Api, LedgerStep::LoanAccount, request)
            .await?;
        session.ledger.record_initiation(
            LedgerStep::LoanAccount,
            response.utility_reference_id.clone(),
            response.web_url.clone(),
        )?;
        session.ledger.record_status(
            LedgerStep::LoanAccount,
            response.status,
            response.sub_status.clone(),
            response.details.clone(),
        )?;
        let loan_account_id = response
            .details
            .as_ref()
            .and_then(|d| d.get("fenixLoanAccountId"))
            .cloned();
        Ok(
            ActionOutcome::from_response("Loan account created", &response).with_data(json!({
                "loanAccountId": loan_account_id,
            })),
        )
    }

    async fn status_check(&self, session: &mut Session, step: LedgerStep) -> Result<ActionOutcome> {
        let reference = existing_reference(session, step)?;
        let response = self.poll(step, &reference).await?;
        session.ledger.record_status(
            step,
            response.status,
            response.sub_status.clone(),
            response.details.clone(),
        )?;
        Ok(ActionOutcome::from_response(
            format!("{step} status retrieved"),
            &response,
        ))
    }

    // --- provider plumbing ---------------------------------------------

    async fn initiate(
        &self,
        class: OperationClass,
        step: LedgerStep,
        request: InitiateRequest,
    ) -> Result<UtilityResponse> {
        Ok(self
            .retry
            .execute(class, || self.provider.initiate(step, request.clone()))
            .await?)
    }

    async fn poll(&self, step: LedgerStep, reference_id: &str) -> Result<UtilityResponse> {
        Ok(self
            .retry
            .execute(OperationClass::Verification, || {
                self.provider.status(step, reference_id)
            })
            .await?)
    }

    async fn confirm(
        &self,
        step: LedgerStep,
        reference_id: &str,
        params: Value,
    ) -> Result<UtilityResponse> {
        Ok(self
            .retry
            .execute(OperationClass::Verification, || {
                self.provider.confirm(step, reference_id, params.clone())
            })
            .await?)
    }
}

/// Failure class for the action envelope, mirroring the upstream error
/// taxonomy: credential problems, upstream rejections, everything else.
fn error_class(error: &Error) -> &'static str {
    match error {
        Error::Authentication(_) | Error::Provider(ProviderError::Auth(_)) => {
            "AUTHENTICATION_ERROR"
        }
        Error::Provider(ProviderError::Api { .. }) => "API_ERROR",
        _ => "EXECUTION_ERROR",
    }
}

// --- validation helpers ------------------------------------------------

fn require_str(params: &Value, field: &str) -> Result<String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Validation(ValidationError::MissingFields {
                fields: vec![field.to_string()],
            })
        })
}

fn require_enum(field: &str, value: &str, allowed: &[&str]) -> Result<()> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(Error::Validation(ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("'{value}' is not one of {}", allowed.join(", ")),
        }))
    }
}

fn require_otp(params: &Value) -> Result<String> {
    let otp = require_str(params, "otp")?;
    if otp.len() == 6 && otp.chars().all(|c| c.is_ascii_digit()) {
        Ok(otp)
    } else {
        Err(Error::Validation(ValidationError::InvalidFormat {
            field: "otp".into(),
            expected: "a 6-digit code".into(),
        }))
    }
}

/// Conflict guard: an initiation must not run while the step holds an
/// open reference.
fn check_no_open_reference(session: &Session, step: LedgerStep) -> Result<()> {
    if let Some(open) = session.ledger.open_reference(step) {
        return Err(Error::Conflict(crate::error::ConflictError {
            step: step.to_string(),
            reference_id: open.reference_id.clone(),
        }));
    }
    Ok(())
}

fn existing_reference(session: &Session, step: LedgerStep) -> Result<String> {
    session
        .ledger
        .get(step)
        .map(|r| r.reference_id.clone())
        .ok_or_else(|| {
            Error::Precondition(crate::error::PreconditionError {
                missing: vec![step.to_string()],
            })
        })
}

fn open_reference(session: &Session, step: LedgerStep) -> Result<String> {
    session
        .ledger
        .open_reference(step)
        .map(|r| r.reference_id.clone())
        .ok_or_else(|| {
            Error::Precondition(crate::error::PreconditionError {
                missing: vec![step.to_string()],
            })
        })
}
