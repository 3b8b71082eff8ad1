//! HTTP handlers for the operational and admin surface.
//!
//! Webhook and metered-action handlers live next to their pipelines in
//! [`crate::webhook::handler`] and [`crate::metered::handler`].

pub mod admin;
pub mod status;

pub use status::{HealthResponse, StatusResponse, SERVER_NAME, SERVER_VERSION};
