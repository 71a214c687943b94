//! Onboarding step graph — the ordered pipeline of states.
//!
//! The transition graph is data: each step exposes its allowed successor
//! set, and the engine advances only along that table. Re-entering the
//! current step (re-prompt after invalid input or a failed call) is always
//! allowed and not listed per step.

use serde::{Deserialize, Serialize};

use crate::session::ledger::LedgerStep;

/// The states of the onboarding pipeline, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnboardingStep {
    Init,
    CollectContact,
    VerifyContact,
    AskMfConsent,
    CollectPan,
    MfFetchOtp,
    ShowMfDetails,
    CollectPledgeAmount,
    ConfirmPledge,
    MfPledgeOtp,
    AskKycConsent,
    InitiateKyc,
    VerifyKyc,
    HandleKycDeviation,
    CollectBankDetails,
    VerifyBank,
    HandleBankDeviation,
    SetupMandate,
    VerifyMandate,
    SetupAgreement,
    VerifyAgreement,
    CreateLoan,
    Done,
}

impl OnboardingStep {
    /// Forward transitions allowed out of this step (re-entry excluded).
    pub fn successors(&self) -> &'static [OnboardingStep] {
        use OnboardingStep::*;
        match self {
            Init => &[CollectContact],
            CollectContact => &[VerifyContact],
            VerifyContact => &[AskMfConsent],
            // The mutual-fund branch is optional: a negative consent
            // answer skips straight to KYC consent.
            AskMfConsent => &[CollectPan, AskKycConsent],
            CollectPan => &[MfFetchOtp],
            MfFetchOtp => &[ShowMfDetails],
            // An empty eligible portfolio leaves the branch here.
            ShowMfDetails => &[CollectPledgeAmount, AskKycConsent],
            CollectPledgeAmount => &[ConfirmPledge],
            ConfirmPledge => &[MfPledgeOtp, CollectPledgeAmount],
            MfPledgeOtp => &[AskKycConsent],
            AskKycConsent => &[InitiateKyc],
            InitiateKyc => &[VerifyKyc],
            VerifyKyc => &[HandleKycDeviation, CollectBankDetails],
            HandleKycDeviation => &[VerifyKyc],
            CollectBankDetails => &[VerifyBank],
            VerifyBank => &[HandleBankDeviation, SetupMandate],
            HandleBankDeviation => &[VerifyBank],
            SetupMandate => &[VerifyMandate],
            VerifyMandate => &[SetupAgreement],
            SetupAgreement => &[VerifyAgreement],
            VerifyAgreement => &[CreateLoan],
            CreateLoan => &[Done],
            Done => &[],
        }
    }

    /// Check if a transition from `self` to `target` is valid.
    /// Re-entry into the same step is always permitted.
    pub fn can_transition_to(&self, target: OnboardingStep) -> bool {
        *self == target || self.successors().contains(&target)
    }

    /// Whether this step is terminal (onboarding complete).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// The ledger step this state tracks, if it drives one.
    pub fn ledger_step(&self) -> Option<LedgerStep> {
        use OnboardingStep::*;
        match self {
            CollectPan | MfFetchOtp | ShowMfDetails => Some(LedgerStep::MfFetch),
            CollectPledgeAmount | ConfirmPledge | MfPledgeOtp => Some(LedgerStep::MfPledge),
            InitiateKyc | VerifyKyc | HandleKycDeviation => Some(LedgerStep::Kyc),
            CollectBankDetails | VerifyBank | HandleBankDeviation => Some(LedgerStep::BankAccount),
            SetupMandate | VerifyMandate => Some(LedgerStep::Mandate),
            SetupAgreement | VerifyAgreement => Some(LedgerStep::Agreement),
            CreateLoan => Some(LedgerStep::LoanAccount),
            _ => None,
        }
    }

    /// Steps in the mutual-fund branch.
    pub fn in_mf_branch(&self) -> bool {
        use OnboardingStep::*;
        matches!(
            self,
            CollectPan
                | MfFetchOtp
                | ShowMfDetails
                | CollectPledgeAmount
                | ConfirmPledge
                | MfPledgeOtp
        )
    }
}

impl Default for OnboardingStep {
    fn default() -> Self {
        Self::Init
    }
}

impl std::fmt::Display for OnboardingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::CollectContact => "COLLECT_CONTACT",
            Self::VerifyContact => "VERIFY_CONTACT",
            Self::AskMfConsent => "ASK_MF_CONSENT",
            Self::CollectPan => "COLLECT_PAN",
            Self::MfFetchOtp => "MF_FETCH_OTP",
            Self::ShowMfDetails => "SHOW_MF_DETAILS",
            Self::CollectPledgeAmount => "COLLECT_PLEDGE_AMOUNT",
            Self::ConfirmPledge => "CONFIRM_PLEDGE",
            Self::MfPledgeOtp => "MF_PLEDGE_OTP",
            Self::AskKycConsent => "ASK_KYC_CONSENT",
            Self::InitiateKyc => "INITIATE_KYC",
            Self::VerifyKyc => "VERIFY_KYC",
            Self::HandleKycDeviation => "HANDLE_KYC_DEVIATION",
            Self::CollectBankDetails => "COLLECT_BANK_DETAILS",
            Self::VerifyBank => "VERIFY_BANK",
            Self::HandleBankDeviation => "HANDLE_BANK_DEVIATION",
            Self::SetupMandate => "SETUP_MANDATE",
            Self::VerifyMandate => "VERIFY_MANDATE",
            Self::SetupAgreement => "SETUP_AGREEMENT",
            Self::VerifyAgreement => "VERIFY_AGREEMENT",
            Self::CreateLoan => "CREATE_LOAN",
            Self::Done => "DONE",
        };
        write!(f, "{s}")
    }
}

/// All steps in canonical order, for graph traversal tests and progress
/// rendering.
pub const ALL_STEPS: &[OnboardingStep] = &[
    OnboardingStep::Init,
    OnboardingStep::CollectContact,
    OnboardingStep::VerifyContact,
    OnboardingStep::AskMfConsent,
    OnboardingStep::CollectPan,
    OnboardingStep::MfFetchOtp,
    OnboardingStep::ShowMfDetails,
    OnboardingStep::CollectPledgeAmount,
    OnboardingStep::ConfirmPledge,
    OnboardingStep::MfPledgeOtp,
    OnboardingStep::AskKycConsent,
    OnboardingStep::InitiateKyc,
    OnboardingStep::VerifyKyc,
    OnboardingStep::HandleKycDeviation,
    OnboardingStep::CollectBankDetails,
    OnboardingStep::VerifyBank,
    OnboardingStep::HandleBankDeviation,
    OnboardingStep::SetupMandate,
    OnboardingStep::VerifyMandate,
    OnboardingStep::SetupAgreement,
    OnboardingStep::VerifyAgreement,
    OnboardingStep::CreateLoan,
    OnboardingStep::Done,
];
