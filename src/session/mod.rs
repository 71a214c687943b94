//! Session state: the per-user record, its reference ledger, and the
//! persistence seam.

pub mod ledger;
pub mod model;
pub mod store;

pub use ledger::{LedgerStep, ReferenceLedger, ReferenceRecord, StepStatus};
pub use model::{DeliveryState, Holding, MessageStatus, MutualFundContext, Role, Session, Turn, UserInfo};
pub use store::{InMemorySessionStore, SessionManager, SessionSnapshot, SessionStore};
