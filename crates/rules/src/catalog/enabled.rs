use serde::Deserialize;
use vigil_core::Severity;
use vigil_eisenbahn::{SourceDescriptor, SourceView};

use super::{source_key, SummaryState, SUMMARY_STATE_TOPIC};
use crate::error::RuleError;
use crate::registry::parse_config;
use crate::rule::{Evaluation, Rule, Trigger};

const CLASS: &str = "Enabled";

fn none() -> Severity {
    Severity::None
}

fn serious() -> Severity {
    Severity::Serious
}

fn critical() -> Severity {
    Severity::Critical
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnabledConfig {
    /// Component as `name` or `name:index`.
    pub name: String,
    #[serde(default = "none")]
    pub disabled_severity: Severity,
    #[serde(default = "none")]
    pub standby_severity: Severity,
    #[serde(default = "serious")]
    pub offline_severity: Severity,
    #[serde(default = "critical")]
    pub fault_severity: Severity,
}

/// Alarm when a component is not in the ENABLED state.
pub struct Enabled {
    name: String,
    sources: Vec<SourceDescriptor>,
    config: EnabledConfig,
}

impl Enabled {
    pub fn new(config: EnabledConfig) -> Result<Self, RuleError> {
        let source = source_key(CLASS, &config.name)?;
        Ok(Self {
            name: format!("{CLASS}.{source}"),
            sources: vec![SourceDescriptor::callback(&source, SUMMARY_STATE_TOPIC)],
            config,
        })
    }

    pub fn from_config(value: &serde_yaml::Value) -> Result<Self, RuleError> {
        Self::new(parse_config(CLASS, value)?)
    }

    fn severity_for(&self, state: SummaryState) -> Severity {
        match state {
            SummaryState::Enabled => Severity::None,
            SummaryState::Disabled => self.config.disabled_severity,
            SummaryState::Standby => self.config.standby_severity,
            SummaryState::Offline => self.config.offline_severity,
            SummaryState::Fault => self.config.fault_severity,
        }
    }
}

impl Rule for Enabled {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    fn evaluate(&mut self, trigger: Trigger<'_>, _view: &SourceView<'_>) -> Result<Evaluation, RuleError> {
        let Trigger::Sample(sample) = trigger else {
            return Ok(Evaluation::Unchanged);
        };
        let code = sample
            .i64("summaryState")
            .ok_or_else(|| RuleError::Evaluation("sample has no integer summaryState".into()))?;
        // Unknown states are treated as faults.
        let (severity, state_name) = match SummaryState::from_code(code) {
            Some(state) => (self.severity_for(state), state.to_string()),
            None => (self.config.fault_severity, format!("{code} unknown")),
        };
        Ok(Evaluation::set(severity, format!("{state_name} state")))
    }
}
