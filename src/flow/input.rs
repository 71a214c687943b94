//! Raw-input parsing and format validation for the collection steps.
//!
//! Every parser here runs before any external call: invalid input never
//! reaches the network.

use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

use crate::error::ValidationError;
use crate::provider::DocumentType;

static MOBILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)mobile\s*:?\s*(\d{10})\b").unwrap());
static BARE_MOBILE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([6-9]\d{9})\b").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static PAN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b([A-Z]{5}[0-9]{4}[A-Z])\b").unwrap());
static OTP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{6})\b").unwrap());
static AMOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:₹|rs\.?\s*|inr\s*)?([0-9][0-9,]*(?:\.[0-9]{1,2})?)").unwrap());
static ACCOUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{9,18}$").unwrap());
static IFSC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z]{4}0[A-Z0-9]{6}$").unwrap());
static YES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(yes|y|yeah|yep|sure|ok(ay)?|confirm|proceed|haan)\b").unwrap());
static NO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(no|n|nope|nah|cancel|skip|nahi)\b").unwrap());

static ACCOUNT_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([0-9]{9,18})\b").unwrap());
static IFSC_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z]{4}0[A-Za-z0-9]{6})\b").unwrap());

/// Mobile and email extracted from one contact message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactDetails {
    pub mobile: String,
    pub email: String,
}

/// Extract a 10-digit mobile number and an email address. Both must be
/// present.
pub fn parse_contact(input: &str) -> Result<ContactDetails, ValidationError> {
    let mobile = MOBILE_RE
        .captures(input)
        .or_else(|| BARE_MOBILE_RE.captures(input))
        .map(|c| c[1].to_string());
    let email = EMAIL_RE.find(input).map(|m| m.as_str().to_string());

    match (mobile, email) {
        (Some(mobile), Some(email)) => Ok(ContactDetails { mobile, email }),
        (mobile, email) => {
            let mut missing = Vec::new();
            if mobile.is_none() {
                missing.push("mobile".to_string());
            }
            if email.is_none() {
                missing.push("email".to_string());
            }
            Err(ValidationError::MissingFields { fields: missing })
        }
    }
}

/// Extract a PAN (permanent account number), normalized to uppercase.
pub fn parse_pan(input: &str) -> Result<String, ValidationError> {
    PAN_RE
        .captures(input)
        .map(|c| c[1].to_uppercase())
        .ok_or(ValidationError::InvalidFormat {
            field: "pan".into(),
            expected: "five letters, four digits, one letter (e.g. ABCDE1234F)".into(),
        })
}

/// Extract a 6-digit OTP.
pub fn parse_otp(input: &str) -> Result<String, ValidationError> {
    OTP_RE
        .captures(input)
        .map(|c| c[1].to_string())
        .ok_or(ValidationError::InvalidFormat {
            field: "otp".into(),
            expected: "a 6-digit code".into(),
        })
}

/// Extract a monetary amount. Accepts `₹`, `Rs`, `INR` prefixes and comma
/// grouping.
pub fn parse_amount(input: &str) -> Result<Decimal, ValidationError> {
    let captures = AMOUNT_RE
        .captures(input)
        .ok_or_else(|| ValidationError::InvalidFormat {
            field: "amount".into(),
            expected: "a positive amount, e.g. ₹50,000".into(),
        })?;
    let normalized = captures[1].replace(',', "");
    let amount: Decimal = normalized
        .parse()
        .map_err(|_| ValidationError::InvalidValue {
            field: "amount".into(),
            message: format!("'{normalized}' is not a valid amount"),
        })?;
    if amount <= Decimal::ZERO {
        return Err(ValidationError::InvalidValue {
            field: "amount".into(),
            message: "amount must be greater than zero".into(),
        });
    }
    Ok(amount)
}

/// Interpret a consent/confirmation answer. `None` when the reply is
/// neither clearly affirmative nor negative.
pub fn parse_yes_no(input: &str) -> Option<bool> {
    if YES_RE.is_match(input) {
        Some(true)
    } else if NO_RE.is_match(input) {
        Some(false)
    } else {
        None
    }
}

/// Recognize an evidence document type from free text.
pub fn parse_document_type(input: &str) -> Option<DocumentType> {
    let lower = input.to_lowercase();
    if lower.contains("passport") {
        Some(DocumentType::Passport)
    } else if lower.contains("driving") || lower.contains("licence") || lower.contains("license") {
        Some(DocumentType::DrivingLicense)
    } else if lower.contains("election") || lower.contains("voter") {
        Some(DocumentType::ElectionCard)
    } else if lower.contains("cheque") || lower.contains("check") {
        Some(DocumentType::CancelledCheque)
    } else if lower.contains("passbook") {
        Some(DocumentType::Passbook)
    } else if lower.contains("statement") {
        Some(DocumentType::BankStatement)
    } else {
        None
    }
}

/// Bank account details extracted from one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankDetails {
    pub account_number: String,
    pub ifsc_code: String,
}

/// Extract an account number and IFSC code. Both must be present.
pub fn parse_bank_details(input: &str) -> Result<BankDetails, ValidationError> {
    let ifsc = IFSC_TOKEN_RE.captures(input).map(|c| c[1].to_uppercase());
    // Strip the IFSC token first so its digit run cannot be mistaken for
    // an account number.
    let without_ifsc = IFSC_TOKEN_RE.replace_all(input, " ");
    let account = ACCOUNT_TOKEN_RE
        .captures(&without_ifsc)
        .map(|c| c[1].to_string());

    match (account, ifsc) {
        (Some(account_number), Some(ifsc_code)) => Ok(BankDetails {
            account_number,
            ifsc_code,
        }),
        (account, ifsc) => {
            let mut missing = Vec::new();
            if account.is_none() {
                missing.push("accountNumber".to_string());
            }
            if ifsc.is_none() {
                missing.push("ifscCode".to_string());
            }
            Err(ValidationError::MissingFields { fields: missing })
        }
    }
}

/// Validate a bank account number (9 to 18 digits).
pub fn validate_account_number(value: &str) -> Result<(), ValidationError> {
    if ACCOUNT_RE.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFormat {
            field: "accountNumber".into(),
            expected: "9 to 18 digits".into(),
        })
    }
}

/// Validate an IFSC routing code.
pub fn validate_ifsc(value: &str) -> Result<(), ValidationError> {
    if IFSC_RE.is_match(value.trim().to_uppercase().as_str()) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFormat {
            field: "ifscCode".into(),
            expected: "4 letters, a zero, then 6 alphanumerics (e.g. HDFC0001234)".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn contact_parses_labelled_and_bare_forms() {
        let parsed = parse_contact("mobile: 9876543210, email: user@example.com").unwrap();
        assert_eq!(parsed.mobile, "9876543210");
        assert_eq!(parsed.email, "user@example.com");

        let parsed = parse_contact("reach me at 9123456780 / a.b+tag@mail.co.in").unwrap();
        assert_eq!(parsed.mobile, "9123456780");
        assert_eq!(parsed.email, "a.b+tag@mail.co.in");
    }

    #[test]
    fn contact_reports_whats_missing() {
        let err = parse_contact("just an email user@example.com").unwrap_err();
        match err {
            ValidationError::MissingFields { fields } => assert_eq!(fields, vec!["mobile"]),
            other => panic!("unexpected error: {other:?}"),
        }
        let err = parse_contact("hello there").unwrap_err();
        match err {
            ValidationError::MissingFields { fields } => {
                assert_eq!(fields, vec!["mobile", "email"])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn pan_is_case_insensitive_and_normalized() {
        assert_eq!(parse_pan("my pan is abcde1234f").unwrap(), "ABCDE1234F");
        assert_eq!(parse_pan("ABCDE1234F").unwrap(), "ABCDE1234F");
        assert!(parse_pan("ABC1234567").is_err());
    }

    #[test]
    fn otp_requires_exactly_six_digits() {
        assert_eq!(parse_otp("the code is 123456").unwrap(), "123456");
        assert!(parse_otp("12345").is_err());
        // Seven digits is not an OTP
        assert!(parse_otp("1234567").is_err());
    }

    #[test]
    fn amounts_accept_currency_prefixes_and_commas() {
        assert_eq!(parse_amount("₹50,000").unwrap(), dec!(50000));
        assert_eq!(parse_amount("Rs. 1,00,000").unwrap(), dec!(100000));
        assert_eq!(parse_amount("pledge 25000.50 please").unwrap(), dec!(25000.50));
        assert!(parse_amount("zero rupees").is_err());
        assert!(parse_amount("0").is_err());
    }

    #[test]
    fn yes_no_detection() {
        assert_eq!(parse_yes_no("yes please"), Some(true));
        assert_eq!(parse_yes_no("Okay"), Some(true));
        assert_eq!(parse_yes_no("no thanks"), Some(false));
        assert_eq!(parse_yes_no("skip this"), Some(false));
        assert_eq!(parse_yes_no("maybe later"), None);
    }

    #[test]
    fn bank_details_extracts_account_and_ifsc() {
        let parsed = parse_bank_details("account 123456789012 ifsc hdfc0001234").unwrap();
        assert_eq!(parsed.account_number, "123456789012");
        assert_eq!(parsed.ifsc_code, "HDFC0001234");

        let err = parse_bank_details("123456789012").unwrap_err();
        match err {
            ValidationError::MissingFields { fields } => assert_eq!(fields, vec!["ifscCode"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn account_number_bounds() {
        assert!(validate_account_number("123456789").is_ok());
        assert!(validate_account_number("123456789012345678").is_ok());
        assert!(validate_account_number("12345678").is_err());
        assert!(validate_account_number("1234567890123456789").is_err());
        assert!(validate_account_number("12345abc9").is_err());
    }

    #[test]
    fn document_type_keywords() {
        assert_eq!(parse_document_type("I have my passport"), Some(DocumentType::Passport));
        assert_eq!(
            parse_document_type("driving licence photo"),
            Some(DocumentType::DrivingLicense)
        );
        assert_eq!(
            parse_document_type("a cancelled cheque"),
            Some(DocumentType::CancelledCheque)
        );
        assert_eq!(
            parse_document_type("bank statement pdf"),
            Some(DocumentType::BankStatement)
        );
        assert_eq!(parse_document_type("aadhaar"), None);
    }

    #[test]
    fn ifsc_format() {
        assert!(validate_ifsc("HDFC0001234").is_ok());
        assert!(validate_ifsc("hdfc0001234").is_ok());
        assert!(validate_ifsc("HDFC1001234").is_err());
        assert!(validate_ifsc("HDF00012345").is_err());
    }
}
