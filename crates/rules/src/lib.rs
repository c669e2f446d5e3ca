//! Rule contract, rule timers, registry and rule catalog.
//!
//! This crate provides:
//! - The [`Rule`] trait: declared sources, setup, evaluation, start/stop
//! - [`RuleTimer`]: cancellable timers whose firings come back through
//!   the engine loop as [`RuleWake`] events
//! - [`RuleRegistry`]: class name → constructor from YAML config
//! - [`ThresholdHandler`]: severity from one value against ordered levels
//! - A small catalog of rules (`Heartbeat`, `Enabled`, `Telemetry`,
//!   `Threshold`, `test.*`)

pub mod catalog;
pub mod error;
pub mod registry;
pub mod rule;
pub mod threshold;
pub mod timer;

pub use error::RuleError;
pub use registry::{parse_config, RuleConstructor, RuleRegistry};
pub use rule::{Evaluation, Rule, Trigger};
pub use threshold::{Levels, ThresholdHandler};
pub use timer::{RuleContext, RuleTimer, RuleWake};
