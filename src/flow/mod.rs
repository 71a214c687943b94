//! The conversational onboarding flow: step graph, input parsing, and the
//! per-step engine.

pub mod engine;
pub mod input;
pub mod step;

pub use engine::{loan_prerequisites, FlowEngine, StepOutcome};
pub use step::{OnboardingStep, ALL_STEPS};
