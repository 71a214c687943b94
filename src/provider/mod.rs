//! External verification providers — uniform async resource-lifecycle
//! boundary for KYC, bank verification, mutual-fund fetch/pledge, mandate,
//! agreement/KFS, and loan-account submission.

pub mod auth;
pub mod http;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::session::ledger::{LedgerStep, StepStatus};

pub use auth::{AuthHeaders, RequestSigner, SignedMethod};
pub use http::HttpProvider;

/// Uniform response shape for initiate, status, and deviation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtilityResponse {
    pub utility_reference_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    /// Step-specific enrichment: bank details, portfolio holdings,
    /// deviation requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl UtilityResponse {
    /// Whether the provider reported a deviation condition requiring
    /// supplementary evidence.
    pub fn reports_deviation(&self) -> bool {
        self.sub_status.as_deref() == Some("DEVIATION")
            || self
                .details
                .as_ref()
                .and_then(|d| d.get("deviationDetails"))
                .is_some_and(|d| !d.is_null())
    }
}

/// Parameters for an initiation call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub opportunity_id: String,
    /// Step-specific payload, already validated by the caller.
    #[serde(flatten)]
    pub params: serde_json::Value,
}

/// Provider-recognized deviation reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviationReason {
    NameMismatch,
    AddressMismatch,
    DocumentIllegible,
}

/// Supported evidence document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    CancelledCheque,
    Passbook,
    BankStatement,
    DrivingLicense,
    ElectionCard,
    Passport,
}

impl DocumentType {
    /// The verification utility a document type belongs to.
    pub fn utility_type(&self) -> &'static str {
        match self {
            Self::CancelledCheque | Self::Passbook | Self::BankStatement => "BANK_VERIFICATION",
            Self::DrivingLicense | Self::ElectionCard | Self::Passport => "PHOTO_VERIFICATION",
        }
    }
}

/// One supporting document in a deviation resubmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviationDocument {
    pub document_type: DocumentType,
    pub content_base64: String,
    pub mime_type: String,
}

impl DeviationDocument {
    pub fn from_bytes(document_type: DocumentType, bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            document_type,
            content_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }
}

/// A deviation resubmission for an open reference.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviationRequest {
    pub utility_reference_id: String,
    pub deviation_reason: DeviationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    pub documents: Vec<DeviationDocument>,
}

/// Uniform provider operation contract.
#[async_trait]
pub trait VerificationProvider: Send + Sync {
    /// Start a new verification instance for `step`.
    async fn initiate(
        &self,
        step: LedgerStep,
        request: InitiateRequest,
    ) -> Result<UtilityResponse, ProviderError>;

    /// Poll the status of an existing reference.
    async fn status(
        &self,
        step: LedgerStep,
        reference_id: &str,
    ) -> Result<UtilityResponse, ProviderError>;

    /// Confirm an open reference with user-supplied proof (an OTP, a
    /// signed consent). Only meaningful for steps with a confirm leg.
    async fn confirm(
        &self,
        step: LedgerStep,
        reference_id: &str,
        params: serde_json::Value,
    ) -> Result<UtilityResponse, ProviderError>;

    /// Resubmit after a deviation with supporting evidence.
    async fn resolve_deviation(
        &self,
        step: LedgerStep,
        request: DeviationRequest,
    ) -> Result<UtilityResponse, ProviderError>;
}
