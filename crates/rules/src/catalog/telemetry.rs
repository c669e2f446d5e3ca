use std::time::Duration;

use serde::Deserialize;
use vigil_core::Severity;
use vigil_eisenbahn::{SourceDescriptor, SourceView, TopicKey};

use super::{positive_seconds, source_key, SummaryState, SUMMARY_STATE_TOPIC};
use crate::error::RuleError;
use crate::registry::parse_config;
use crate::rule::{Evaluation, Rule, Trigger};
use crate::timer::{RuleContext, RuleTimer};

const CLASS: &str = "Telemetry";

fn default_timeout() -> f64 {
    15.0
}

fn default_alarm_severity() -> Severity {
    Severity::Critical
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Component as `name` or `name:index`.
    pub name: String,
    /// Telemetry topic to watch.
    pub callback_name: String,
    /// States in which the component should be sending telemetry.
    pub summary_states: Vec<SummaryState>,
    /// Maximum time between telemetry samples (sec).
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_alarm_severity")]
    pub alarm_severity: Severity,
}

/// Alarm when telemetry stops arriving while the component is in a state
/// that should produce it.
pub struct Telemetry {
    name: String,
    sources: Vec<SourceDescriptor>,
    state_topic: TopicKey,
    timeout: Duration,
    config: TelemetryConfig,
    expecting: bool,
    timer: Option<RuleTimer>,
}

impl Telemetry {
    pub fn new(config: TelemetryConfig) -> Result<Self, RuleError> {
        let source = source_key(CLASS, &config.name)?;
        if config.summary_states.is_empty() {
            return Err(RuleError::invalid(CLASS, "summary_states must have at least one item"));
        }
        if let Some(bad) = config
            .summary_states
            .iter()
            .find(|s| !matches!(s, SummaryState::Disabled | SummaryState::Enabled))
        {
            return Err(RuleError::invalid(CLASS, format!("{bad} never produces telemetry")));
        }
        let timeout = positive_seconds(CLASS, "timeout", config.timeout)?;
        if config.alarm_severity.is_none() {
            return Err(RuleError::invalid(CLASS, "alarm_severity must be above NONE"));
        }
        Ok(Self {
            name: format!("{CLASS}.{source}"),
            sources: vec![
                SourceDescriptor::callback(&source, config.callback_name.as_str()),
                SourceDescriptor::callback(&source, SUMMARY_STATE_TOPIC),
            ],
            state_topic: source.topic(SUMMARY_STATE_TOPIC),
            timeout,
            config,
            expecting: false,
            timer: None,
        })
    }

    pub fn from_config(value: &serde_yaml::Value) -> Result<Self, RuleError> {
        Self::new(parse_config(CLASS, value)?)
    }

    fn restart_timer(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.restart(self.timeout);
        }
    }
}

impl Rule for Telemetry {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    fn evaluate(&mut self, trigger: Trigger<'_>, _view: &SourceView<'_>) -> Result<Evaluation, RuleError> {
        match trigger {
            Trigger::Sample(sample) if sample.topic == self.state_topic => {
                let state = sample.i64("summaryState").and_then(SummaryState::from_code);
                self.expecting = state.is_some_and(|s| self.config.summary_states.contains(&s));
                if self.expecting {
                    self.restart_timer();
                } else if let Some(timer) = self.timer.as_mut() {
                    timer.cancel();
                }
                Ok(Evaluation::none())
            }
            Trigger::Sample(_) => {
                if self.expecting {
                    self.restart_timer();
                }
                Ok(Evaluation::none())
            }
            Trigger::Timer(wake) => {
                let fired = self.timer.as_mut().is_some_and(|t| t.fire(wake));
                if !fired {
                    return Ok(Evaluation::Unchanged);
                }
                if !self.expecting {
                    return Ok(Evaluation::none());
                }
                Ok(Evaluation::set(
                    self.config.alarm_severity,
                    format!(
                        "Telemetry {} not seen in {} seconds",
                        self.config.callback_name, self.config.timeout
                    ),
                ))
            }
            Trigger::Poll => Ok(Evaluation::Unchanged),
        }
    }

    fn start(&mut self, ctx: &RuleContext) {
        let mut timer = ctx.timer("telemetry");
        timer.restart(self.timeout);
        self.timer = Some(timer);
    }

    fn stop(&mut self) {
        self.timer = None;
    }
}
