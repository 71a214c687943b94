//! HTTP implementation of [`VerificationProvider`] against the lending
//! platform's utility APIs.
//!
//! Transport faults, 429 and 5xx responses map to transient errors so the
//! retry layer can act on them; other 4xx responses are permanent. A 401
//! is surfaced as an authentication failure, never retried.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::error::{AuthenticationError, ProviderError};
use crate::session::ledger::LedgerStep;

use super::auth::{
    AuthHeaders, RequestSigner, SignedMethod, HEADER_CHANNEL_CODE, HEADER_SIGNATURE,
    HEADER_TIMESTAMP,
};
use super::{DeviationRequest, InitiateRequest, UtilityResponse, VerificationProvider};

/// Path templates for one pipeline step. `{opportunityId}` and `{id}` are
/// substituted at call time.
struct Endpoints {
    initiate: &'static str,
    status: &'static str,
    confirm: Option<&'static str>,
}

fn endpoints_for(step: LedgerStep) -> Endpoints {
    use LedgerStep::*;
    match step {
        // Contact verification logs are confirmed with the code or link
        // outcome posted back onto the log itself.
        Mobile | Email => Endpoints {
            initiate: "/utility/verification/log",
            status: "/utility/verification/log/{id}",
            confirm: Some("/utility/verification/log/{id}"),
        },
        Kyc => Endpoints {
            initiate: "/utility/verification/log",
            status: "/utility/verification/log/{id}",
            confirm: None,
        },
        BankAccount => Endpoints {
            initiate: "/utility/bank/verification/init",
            status: "/utility/bank/verification/{id}",
            confirm: None,
        },
        MfFetch => Endpoints {
            initiate: "/mutualFund/fetch/trigger-otp",
            status: "/mutualFund/fetch/{id}",
            confirm: Some("/mutualFund/fetch/{id}/validate-otp"),
        },
        MfPledge => Endpoints {
            initiate: "/mutualFund/pledge/trigger-otp",
            status: "/mutualFund/pledge/{id}",
            confirm: Some("/mutualFund/pledge/{id}/verify-otp"),
        },
        Mandate => Endpoints {
            initiate: "/opportunities/{opportunityId}/mandates",
            status: "/opportunities/mandates/{id}",
            confirm: None,
        },
        // One contract call covers both the agreement and the key-facts
        // statement; each gets its own reference in the response.
        Agreement | Kfs => Endpoints {
            initiate: "/opportunity/{opportunityId}/loan/contract",
            status: "/opportunity/loan/contract/{id}/status",
            confirm: None,
        },
        LoanAccount => Endpoints {
            initiate: "/opportunity/{opportunityId}/submit",
            status: "/opportunity/submit/{id}",
            confirm: None,
        },
    }
}

const DEVIATION_PATH: &str = "/utility/review";

/// Standard response envelope: `{ "success": bool, "data": {...} }`.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    signer: RequestSigner,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let signer = RequestSigner::new(config.channel_code.clone(), config.secret_key.clone())?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transient {
                reason: format!("http client init: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            signer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_headers(request: reqwest::RequestBuilder, headers: AuthHeaders) -> reqwest::RequestBuilder {
        request
            .header(HEADER_TIMESTAMP, headers.timestamp)
            .header(HEADER_CHANNEL_CODE, headers.channel_code)
            .header(HEADER_SIGNATURE, headers.signature)
    }

    async fn get(&self, path: &str) -> Result<UtilityResponse, ProviderError> {
        let headers = self.signer.sign(SignedMethod::Get, None)?;
        let request = Self::apply_headers(self.client.get(self.url(path)), headers);
        let response = request.send().await.map_err(map_transport_error)?;
        parse_response(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<UtilityResponse, ProviderError> {
        let serialized =
            serde_json::to_string(body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let headers = self.signer.sign(SignedMethod::Post, Some(&serialized))?;
        let request = Self::apply_headers(self.client.post(self.url(path)), headers)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(serialized);
        let response = request.send().await.map_err(map_transport_error)?;
        parse_response(response).await
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Transient {
        reason: if e.is_timeout() {
            format!("request timed out: {e}")
        } else if e.is_connect() {
            format!("connection failed: {e}")
        } else {
            format!("transport error: {e}")
        },
    }
}

async fn parse_response(response: reqwest::Response) -> Result<UtilityResponse, ProviderError> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| ProviderError::InvalidResponse(format!("malformed body: {e}")))?;

    if status == StatusCode::UNAUTHORIZED {
        let reason = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("signature rejected")
            .to_string();
        return Err(ProviderError::Auth(AuthenticationError::SignatureRejected {
            reason,
        }));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(ProviderError::Transient {
            reason: format!("upstream returned {status}"),
        });
    }
    if status.is_client_error() {
        return Err(ProviderError::Api {
            status: status.as_u16(),
            message: body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request rejected")
                .to_string(),
            details: Some(body),
        });
    }

    let envelope: Envelope = serde_json::from_value(body.clone())
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    if envelope.success == Some(false) {
        return Err(ProviderError::Api {
            status: status.as_u16(),
            message: envelope
                .message
                .unwrap_or_else(|| "operation unsuccessful".into()),
            details: Some(body),
        });
    }
    let payload = envelope.data.unwrap_or(body);
    serde_json::from_value(payload).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

fn fill(template: &str, opportunity_id: Option<&str>, reference_id: Option<&str>) -> String {
    let mut path = template.to_string();
    if let Some(opp) = opportunity_id {
        path = path.replace("{opportunityId}", opp);
    }
    if let Some(id) = reference_id {
        path = path.replace("{id}", id);
    }
    path
}

#[async_trait]
impl VerificationProvider for HttpProvider {
    async fn initiate(
        &self,
        step: LedgerStep,
        request: InitiateRequest,
    ) -> Result<UtilityResponse, ProviderError> {
        let path = fill(
            endpoints_for(step).initiate,
            Some(&request.opportunity_id),
            None,
        );
        let body = serde_json::to_value(&request)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        tracing::debug!(step = %step, path = %path, "Initiating verification");
        self.post(&path, &body).await
    }

    async fn status(
        &self,
        step: LedgerStep,
        reference_id: &str,
    ) -> Result<UtilityResponse, ProviderError> {
        let path = fill(endpoints_for(step).status, None, Some(reference_id));
        tracing::debug!(step = %step, reference = %reference_id, "Polling verification status");
        self.get(&path).await
    }

    async fn confirm(
        &self,
        step: LedgerStep,
        reference_id: &str,
        params: Value,
    ) -> Result<UtilityResponse, ProviderError> {
        let Some(template) = endpoints_for(step).confirm else {
            return Err(ProviderError::Api {
                status: 400,
                message: format!("step {step} has no confirmation leg"),
                details: None,
            });
        };
        let path = fill(template, None, Some(reference_id));
        tracing::debug!(step = %step, reference = %reference_id, "Confirming verification");
        self.post(&path, &params).await
    }

    async fn resolve_deviation(
        &self,
        step: LedgerStep,
        request: DeviationRequest,
    ) -> Result<UtilityResponse, ProviderError> {
        debug_assert!(step.supports_deviation());
        let body = serde_json::to_value(&request)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        tracing::debug!(step = %step, reference = %request.utility_reference_id, "Submitting deviation review");
        self.post(DEVIATION_PATH, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_templates_fill_cleanly() {
        let path = fill(
            endpoints_for(LedgerStep::Mandate).initiate,
            Some("OPP-9"),
            None,
        );
        assert_eq!(path, "/opportunities/OPP-9/mandates");

        let path = fill(endpoints_for(LedgerStep::MfFetch).confirm.unwrap(), None, Some("F-1"));
        assert_eq!(path, "/mutualFund/fetch/F-1/validate-otp");

        let path = fill(endpoints_for(LedgerStep::Kyc).status, None, Some("K-1"));
        assert_eq!(path, "/utility/verification/log/K-1");
    }

    #[test]
    fn otp_steps_have_confirm_legs() {
        assert!(endpoints_for(LedgerStep::MfFetch).confirm.is_some());
        assert!(endpoints_for(LedgerStep::MfPledge).confirm.is_some());
        assert!(endpoints_for(LedgerStep::Kyc).confirm.is_none());
        assert!(endpoints_for(LedgerStep::BankAccount).confirm.is_none());
    }

    #[test]
    fn envelope_unwraps_data() {
        let body = serde_json::json!({
            "success": true,
            "data": {
                "utilityReferenceId": "U-1",
                "status": "IN_PROGRESS"
            }
        });
        let envelope: Envelope = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.success, Some(true));
        let response: UtilityResponse =
            serde_json::from_value(envelope.data.unwrap()).unwrap();
        assert_eq!(response.utility_reference_id, "U-1");
    }
}
