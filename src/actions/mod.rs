//! The fixed action catalog and the router that executes it.

pub mod catalog;
pub mod dispatch;

pub use catalog::{catalog, ActionDescriptor};
pub use dispatch::{ActionOutcome, ActionRouter};
