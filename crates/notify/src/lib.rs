//! Escalation of unacknowledged critical alarms to an incident service.
//!
//! This crate provides:
//! - The [`Escalator`] trait: create and resolve one incident per event id
//! - [`WebhookEscalator`]: JSON over HTTP to the incident webhook
//! - [`EscalationTable`]: alarm name globs → responder and delay

pub mod policy;
pub mod traits;
pub mod webhook;

pub use policy::{glob_to_regex, EscalationPolicy, EscalationTable};
pub use traits::{DisabledEscalator, Escalator, Incident, NotifyError};
pub use webhook::WebhookEscalator;
