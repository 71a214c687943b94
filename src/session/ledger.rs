//! Reference-ID ledger — per-session record of external reference ids and
//! last-known status for every pipeline step.
//!
//! Guarantee: exactly one open (non-terminal) reference per step at a time.
//! A record is created only by that step's initiation and is refreshed only
//! by that step's own status or deviation-resolution call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConflictError;

/// Pipeline steps tracked in the ledger. Wire names match the upstream
/// utility identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LedgerStep {
    Mobile,
    Email,
    Kyc,
    BankAccount,
    Mandate,
    Agreement,
    Kfs,
    MfFetch,
    MfPledge,
    LoanAccount,
}

impl LedgerStep {
    /// Steps whose deviation flow allows `PENDING_CHECKER_APPROVAL` to
    /// count as accepted.
    pub fn supports_deviation(&self) -> bool {
        matches!(self, Self::Kyc | Self::BankAccount)
    }
}

impl std::fmt::Display for LedgerStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mobile => "mobile",
            Self::Email => "email",
            Self::Kyc => "kyc",
            Self::BankAccount => "bankAccount",
            Self::Mandate => "mandate",
            Self::Agreement => "agreement",
            Self::Kfs => "kfs",
            Self::MfFetch => "mfFetch",
            Self::MfPledge => "mfPledge",
            Self::LoanAccount => "loanAccount",
        };
        write!(f, "{s}")
    }
}

/// Provider-reported status of one verification instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    PendingCheckerApproval,
    Approved,
    Rejected,
    Failed,
    Expired,
}

impl StepStatus {
    /// Terminal statuses close a reference; everything else keeps it open.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Rejected | Self::Failed | Self::Expired
        )
    }

    /// Whether this status lets the pipeline advance past `step`.
    pub fn is_accepted_for(&self, step: LedgerStep) -> bool {
        match self {
            Self::Approved => true,
            Self::PendingCheckerApproval => step.supports_deviation(),
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::PendingCheckerApproval => "PENDING_CHECKER_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// One step's reference record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub reference_id: String,
    pub status: StepStatus,
    pub sub_status: Option<String>,
    pub web_url: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// The per-session reference ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceLedger {
    entries: HashMap<LedgerStep, ReferenceRecord>,
}

impl ReferenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh initiation for `step`.
    ///
    /// Rejected with [`ConflictError`] if the step already holds an open
    /// (non-terminal) reference — the caller must poll status or resolve
    /// the deviation before re-initiating.
    pub fn record_initiation(
        &mut self,
        step: LedgerStep,
        reference_id: impl Into<String>,
        web_url: Option<String>,
    ) -> Result<(), ConflictError> {
        if let Some(open) = self.open_reference(step) {
            return Err(ConflictError {
                step: step.to_string(),
                reference_id: open.reference_id.clone(),
            });
        }
        self.entries.insert(
            step,
            ReferenceRecord {
                reference_id: reference_id.into(),
                status: StepStatus::Pending,
                sub_status: None,
                web_url,
                details: None,
            },
        );
        Ok(())
    }

    /// Refresh the status of an existing record. Only the step's own
    /// status-check or deviation-resolution call may do this; a step with
    /// no record cannot receive a status.
    pub fn record_status(
        &mut self,
        step: LedgerStep,
        status: StepStatus,
        sub_status: Option<String>,
        details: Option<serde_json::Value>,
    ) -> Result<(), ConflictError> {
        match self.entries.get_mut(&step) {
            Some(record) => {
                record.status = status;
                record.sub_status = sub_status;
                if details.is_some() {
                    record.details = details;
                }
                Ok(())
            }
            None => Err(ConflictError {
                step: step.to_string(),
                reference_id: String::new(),
            }),
        }
    }

    pub fn get(&self, step: LedgerStep) -> Option<&ReferenceRecord> {
        self.entries.get(&step)
    }

    /// The open (non-terminal) reference for a step, if one exists.
    pub fn open_reference(&self, step: LedgerStep) -> Option<&ReferenceRecord> {
        self.entries
            .get(&step)
            .filter(|r| !r.status.is_terminal())
    }

    /// Whether `step` holds a reference in an accepted status.
    pub fn is_accepted(&self, step: LedgerStep) -> bool {
        self.entries
            .get(&step)
            .is_some_and(|r| r.status.is_accepted_for(step))
    }

    /// The steps from `required` that are missing or not accepted.
    pub fn unsatisfied(&self, required: &[LedgerStep]) -> Vec<LedgerStep> {
        required
            .iter()
            .copied()
            .filter(|s| !self.is_accepted(*s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initiation_with_open_reference_conflicts() {
        let mut ledger = ReferenceLedger::new();
        ledger
            .record_initiation(LedgerStep::Kyc, "ref-1", None)
            .unwrap();

        let err = ledger
            .record_initiation(LedgerStep::Kyc, "ref-2", None)
            .unwrap_err();
        assert_eq!(err.step, "kyc");
        assert_eq!(err.reference_id, "ref-1");
    }

    #[test]
    fn reinitiation_allowed_after_terminal_status() {
        let mut ledger = ReferenceLedger::new();
        ledger
            .record_initiation(LedgerStep::Kyc, "ref-1", None)
            .unwrap();
        ledger
            .record_status(LedgerStep::Kyc, StepStatus::Rejected, None, None)
            .unwrap();

        ledger
            .record_initiation(LedgerStep::Kyc, "ref-2", None)
            .unwrap();
        assert_eq!(ledger.get(LedgerStep::Kyc).unwrap().reference_id, "ref-2");
    }

    #[test]
    fn status_refresh_requires_existing_record() {
        let mut ledger = ReferenceLedger::new();
        assert!(
            ledger
                .record_status(LedgerStep::Mandate, StepStatus::Approved, None, None)
                .is_err()
        );
    }

    #[test]
    fn terminal_and_open_statuses() {
        assert!(StepStatus::Approved.is_terminal());
        assert!(StepStatus::Rejected.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Expired.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::InProgress.is_terminal());
        assert!(!StepStatus::PendingCheckerApproval.is_terminal());
    }

    #[test]
    fn checker_approval_accepted_only_for_deviation_steps() {
        let s = StepStatus::PendingCheckerApproval;
        assert!(s.is_accepted_for(LedgerStep::Kyc));
        assert!(s.is_accepted_for(LedgerStep::BankAccount));
        assert!(!s.is_accepted_for(LedgerStep::Mandate));
        assert!(!s.is_accepted_for(LedgerStep::MfPledge));
    }

    #[test]
    fn unsatisfied_lists_missing_and_pending_steps() {
        let mut ledger = ReferenceLedger::new();
        ledger
            .record_initiation(LedgerStep::Kyc, "k1", None)
            .unwrap();
        ledger
            .record_status(LedgerStep::Kyc, StepStatus::Approved, None, None)
            .unwrap();
        ledger
            .record_initiation(LedgerStep::BankAccount, "b1", None)
            .unwrap();

        let missing = ledger.unsatisfied(&[
            LedgerStep::Kyc,
            LedgerStep::BankAccount,
            LedgerStep::Mandate,
        ]);
        assert_eq!(missing, vec![LedgerStep::BankAccount, LedgerStep::Mandate]);
    }

    #[test]
    fn step_display_matches_serde() {
        let steps = [
            LedgerStep::Mobile,
            LedgerStep::Email,
            LedgerStep::Kyc,
            LedgerStep::BankAccount,
            LedgerStep::Mandate,
            LedgerStep::Agreement,
            LedgerStep::Kfs,
            LedgerStep::MfFetch,
            LedgerStep::MfPledge,
            LedgerStep::LoanAccount,
        ];
        for step in steps {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{step}\""));
        }
    }

    #[test]
    fn status_display_matches_serde() {
        let statuses = [
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::PendingCheckerApproval,
            StepStatus::Approved,
            StepStatus::Rejected,
            StepStatus::Failed,
            StepStatus::Expired,
        ];
        for status in statuses {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }
}
