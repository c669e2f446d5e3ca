//! Alarm engine: alarm state machines and the model that drives rules.
//!
//! This crate provides:
//! - [`Alarm`]: severity, acknowledgement, mute and escalation state with
//!   timer-driven transitions
//! - [`Model`]: builds rules from config, brokers shared connections, and
//!   runs every evaluation, timer firing and command on one task
//! - [`ModelHandle`]: the control surface (enable, acknowledge, mute, ...)

pub mod alarm;
pub mod error;
pub mod model;

pub use alarm::{Alarm, AlarmEffect, AlarmEvent, AlarmSettings, AlarmTimer, AlarmWake, TimerHub};
pub use error::EngineError;
pub use model::{Model, ModelHandle, ModelStats};
