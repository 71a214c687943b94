//! Request signing for the verification provider API.
//!
//! Every outbound call carries a channel code, a `yyyyMMddHHmmss` UTC
//! timestamp, and an HMAC-SHA256 signature (base64). GET requests sign the
//! timestamp alone; requests with a body sign `{body}.{timestamp}`.

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::AuthenticationError;

pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_CHANNEL_CODE: &str = "X-SourcingChannelCode";
pub const HEADER_SIGNATURE: &str = "X-Signature";

type HmacSha256 = Hmac<Sha256>;

/// HTTP method as it affects the signing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedMethod {
    Get,
    Post,
    Put,
}

impl SignedMethod {
    fn signs_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

/// The three auth headers attached to a signed request.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub timestamp: String,
    pub channel_code: String,
    pub signature: String,
}

/// Signs outbound requests with the sourcing channel's shared secret.
pub struct RequestSigner {
    channel_code: String,
    secret_key: SecretString,
}

impl RequestSigner {
    pub fn new(
        channel_code: impl Into<String>,
        secret_key: SecretString,
    ) -> Result<Self, AuthenticationError> {
        let channel_code = channel_code.into();
        if channel_code.is_empty() {
            return Err(AuthenticationError::MissingCredential(
                "sourcing channel code".into(),
            ));
        }
        if secret_key.expose_secret().is_empty() {
            return Err(AuthenticationError::MissingCredential("secret key".into()));
        }
        Ok(Self {
            channel_code,
            secret_key,
        })
    }

    /// Sign a request with the current time.
    pub fn sign(
        &self,
        method: SignedMethod,
        body: Option<&str>,
    ) -> Result<AuthHeaders, AuthenticationError> {
        self.sign_at(method, body, &Utc::now().format("%Y%m%d%H%M%S").to_string())
    }

    fn sign_at(
        &self,
        method: SignedMethod,
        body: Option<&str>,
        timestamp: &str,
    ) -> Result<AuthHeaders, AuthenticationError> {
        let payload = if method.signs_body() {
            format!("{}.{}", body.unwrap_or(""), timestamp)
        } else {
            timestamp.to_string()
        };

        let mut mac = HmacSha256::new_from_slice(self.secret_key.expose_secret().as_bytes())
            .map_err(|_| AuthenticationError::MissingCredential("secret key".into()))?;
        mac.update(payload.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(AuthHeaders {
            timestamp: timestamp.to_string(),
            channel_code: self.channel_code.clone(),
            signature,
        })
    }
}
