//! Rule classes shipped with the watcher.

mod enabled;
mod heartbeat;
mod telemetry;
mod test_rules;
mod threshold;

pub use enabled::{Enabled, EnabledConfig};
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use telemetry::{Telemetry, TelemetryConfig};
pub use test_rules::{ConfiguredSeverities, ConfiguredSeveritiesConfig, NoConfig};
pub use threshold::{ThresholdRule, ThresholdRuleConfig};

use std::fmt;
use std::time::Duration;

use vigil_eisenbahn::SourceKey;

use crate::error::RuleError;
use crate::registry::RuleRegistry;

/// Topic carrying a component's heartbeat.
pub const HEARTBEAT_TOPIC: &str = "heartbeat";

/// Topic carrying a component's summary state (`summaryState` field).
pub const SUMMARY_STATE_TOPIC: &str = "summaryState";

pub(crate) fn register_all(registry: &mut RuleRegistry) {
    registry.register("Enabled", |c| Ok(Box::new(Enabled::from_config(c)?)));
    registry.register("Heartbeat", |c| Ok(Box::new(Heartbeat::from_config(c)?)));
    registry.register("Telemetry", |c| Ok(Box::new(Telemetry::from_config(c)?)));
    registry.register("Threshold", |c| Ok(Box::new(ThresholdRule::from_config(c)?)));
    registry.register("test.ConfiguredSeverities", |c| {
        Ok(Box::new(ConfiguredSeverities::from_config(c)?))
    });
    registry.register("test.NoConfig", |c| Ok(Box::new(NoConfig::from_config(c)?)));
}

/// Parse a `name` or `name:index` config value.
pub(crate) fn source_key(class: &str, name: &str) -> Result<SourceKey, RuleError> {
    SourceKey::parse(name).map_err(|e| RuleError::invalid(class, e.to_string()))
}

/// Parse a config value in seconds.
pub(crate) fn seconds(class: &str, field: &str, value: f64) -> Result<Duration, RuleError> {
    vigil_core::seconds(field, value).map_err(|e| RuleError::invalid(class, e.to_string()))
}

/// Parse a config value in seconds that must be above zero.
pub(crate) fn positive_seconds(class: &str, field: &str, value: f64) -> Result<Duration, RuleError> {
    let duration = seconds(class, field, value)?;
    if duration.is_zero() {
        return Err(RuleError::invalid(class, format!("{field}={value} must be positive")));
    }
    Ok(duration)
}

/// Component summary state, as carried in `summaryState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SummaryState {
    Disabled,
    Enabled,
    Fault,
    Offline,
    Standby,
}

impl SummaryState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Disabled),
            2 => Some(Self::Enabled),
            3 => Some(Self::Fault),
            4 => Some(Self::Offline),
            5 => Some(Self::Standby),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "DISABLED",
            Self::Enabled => "ENABLED",
            Self::Fault => "FAULT",
            Self::Offline => "OFFLINE",
            Self::Standby => "STANDBY",
        }
    }
}

impl fmt::Display for SummaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
