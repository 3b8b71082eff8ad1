//! Metered actions
//!
//! Paid calls to the actor platform, charged against the credit ledger
//! before the call and refunded if it fails.

pub mod handler;
pub mod launcher;
pub mod orchestrator;

pub use launcher::{ActorClient, JobLauncher, JobRun, LaunchRequest, MeteredAction};
pub use orchestrator::{
    ActionPolicy, AttemptState, MeteredRequest, MeteredSuccess, Orchestrator,
};
