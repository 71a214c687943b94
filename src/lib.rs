//! loanflow — multi-step onboarding orchestration for loans against
//! mutual funds.
//!
//! The engine drives a customer from first contact through KYC, bank
//! verification, mandate, agreement, and loan-account creation, tracking
//! every external verification in a per-session reference ledger.

pub mod actions;
pub mod config;
pub mod error;
pub mod flow;
pub mod intent;
pub mod orchestrator;
pub mod provider;
pub mod ratelimit;
pub mod retry;
pub mod session;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, TurnResponse};
