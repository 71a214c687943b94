//! The fixed catalog of pipeline actions.
//!
//! Descriptors are handed to the intent-resolution collaborator so it can
//! pick an action and fill its parameters; the router validates against
//! the same schemas before executing.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One action's name, description, and JSON parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

fn descriptor(name: &str, description: &str, parameters: Value) -> ActionDescriptor {
    ActionDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

fn no_params() -> Value {
    json!({ "type": "object", "properties": {}, "required": [] })
}

/// Build the full action catalog.
pub fn catalog() -> Vec<ActionDescriptor> {
    vec![
        descriptor(
            "initiate_kyc",
            "Start KYC verification for the customer and return a completion link.",
            no_params(),
        ),
        descriptor(
            "get_kyc_status",
            "Check the status of the customer's KYC verification.",
            no_params(),
        ),
        descriptor(
            "handle_kyc_deviation",
            "Submit a supporting identity document to resolve a KYC mismatch.",
            json!({
                "type": "object",
                "properties": {
                    "documentType": {
                        "type": "string",
                        "enum": ["DRIVING_LICENSE", "ELECTION_CARD", "PASSPORT"]
                    },
                    "documentBase64": { "type": "string" },
                    "mimeType": { "type": "string" }
                },
                "required": ["documentType", "documentBase64", "mimeType"]
            }),
        ),
        descriptor(
            "initiate_bank_verification",
            "Start verification of the customer's bank account.",
            json!({
                "type": "object",
                "properties": {
                    "accountNumber": {
                        "type": "string",
                        "pattern": "^[0-9]{9,18}$"
                    },
                    "ifscCode": {
                        "type": "string",
                        "pattern": "^[A-Z]{4}0[A-Z0-9]{6}$"
                    },
                    "accountType": {
                        "type": "string",
                        "enum": ["SAVINGS_ACCOUNT", "CURRENT_ACCOUNT"]
                    }
                },
                "required": ["accountNumber", "ifscCode", "accountType"]
            }),
        ),
        descriptor(
            "get_bank_verification_status",
            "Check the status of the customer's bank account verification.",
            no_params(),
        ),
        descriptor(
            "handle_bank_deviation",
            "Submit a supporting bank document to resolve an account-holder mismatch.",
            json!({
                "type": "object",
                "properties": {
                    "documentType": {
                        "type": "string",
                        "enum": ["CANCELLED_CHEQUE", "PASSBOOK", "BANK_STATEMENT"]
                    },
                    "documentBase64": { "type": "string" },
                    "mimeType": { "type": "string" }
                },
                "required": ["documentType", "documentBase64", "mimeType"]
            }),
        ),
        descriptor(
            "send_mf_fetch_otp",
            "Request the customer's mutual-fund portfolio; the registrar sends an OTP.",
            json!({
                "type": "object",
                "properties": {
                    "pan": {
                        "type": "string",
                        "pattern": "^[A-Z]{5}[0-9]{4}[A-Z]$"
                    }
                },
                "required": ["pan"]
            }),
        ),
        descriptor(
            "validate_mf_fetch_otp",
            "Validate the registrar OTP to complete the portfolio fetch.",
            json!({
                "type": "object",
                "properties": {
                    "otp": { "type": "string", "pattern": "^[0-9]{6}$" }
                },
                "required": ["otp"]
            }),
        ),
        descriptor(
            "get_mf_portfolio",
            "Fetch the customer's mutual-fund holdings and pledgeable value.",
            no_params(),
        ),
        descriptor(
            "send_mf_pledge_otp",
            "Initiate a pledge of mutual-fund holdings; the registrar sends an OTP.",
            json!({
                "type": "object",
                "properties": {
                    "amount": { "type": "string" }
                },
                "required": ["amount"]
            }),
        ),
        descriptor(
            "validate_mf_pledge_otp",
            "Validate the registrar OTP to authorize the pledge.",
            json!({
                "type": "object",
                "properties": {
                    "otp": { "type": "string", "pattern": "^[0-9]{6}$" }
                },
                "required": ["otp"]
            }),
        ),
        descriptor(
            "get_mf_pledge_details",
            "Check the status and details of the customer's pledge.",
            no_params(),
        ),
        descriptor(
            "setup_mandate",
            "Set up the repayment mandate against the verified bank account.",
            no_params(),
        ),
        descriptor(
            "get_mandate_status",
            "Check whether the repayment mandate has been authorized.",
            no_params(),
        ),
        descriptor(
            "setup_agreement",
            "Generate the loan agreement and key-facts statement for signing.",
            no_params(),
        ),
        descriptor(
            "get_agreement_status",
            "Check whether the agreement and key-facts statement are signed.",
            no_params(),
        ),
        descriptor(
            "create_loan_account",
            "Submit the completed application and create the loan account.",
            no_params(),
        ),
    ]
}

/// Whether `name` is in the catalog.
pub fn is_known(name: &str) -> bool {
    catalog().iter().any(|d| d.name == name)
}
