use std::time::Duration;

use serde::Deserialize;
use vigil_core::Severity;
use vigil_eisenbahn::{SourceDescriptor, SourceView};

use super::{positive_seconds, source_key, HEARTBEAT_TOPIC};
use crate::error::RuleError;
use crate::registry::parse_config;
use crate::rule::{Evaluation, Rule, Trigger};
use crate::timer::{RuleContext, RuleTimer};

const CLASS: &str = "Heartbeat";

fn default_timeout() -> f64 {
    3.0
}

fn default_alarm_severity() -> Severity {
    Severity::Critical
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Component as `name` or `name:index`.
    pub name: String,
    /// Maximum time between heartbeats (sec).
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_alarm_severity")]
    pub alarm_severity: Severity,
}

/// Dead-man's switch on a component's heartbeat topic.
///
/// Every heartbeat clears the alarm and restarts the timer; if the timer
/// runs out the alarm goes to `alarm_severity`.
pub struct Heartbeat {
    name: String,
    sources: Vec<SourceDescriptor>,
    timeout: Duration,
    config: HeartbeatConfig,
    timer: Option<RuleTimer>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Result<Self, RuleError> {
        let source = source_key(CLASS, &config.name)?;
        let timeout = positive_seconds(CLASS, "timeout", config.timeout)?;
        if config.alarm_severity.is_none() {
            return Err(RuleError::invalid(CLASS, "alarm_severity must be above NONE"));
        }
        Ok(Self {
            name: format!("{CLASS}.{source}"),
            sources: vec![SourceDescriptor::callback(&source, HEARTBEAT_TOPIC)],
            timeout,
            config,
            timer: None,
        })
    }

    pub fn from_config(value: &serde_yaml::Value) -> Result<Self, RuleError> {
        Self::new(parse_config(CLASS, value)?)
    }
}

impl Rule for Heartbeat {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    fn evaluate(&mut self, trigger: Trigger<'_>, _view: &SourceView<'_>) -> Result<Evaluation, RuleError> {
        match trigger {
            Trigger::Sample(_) => {
                if let Some(timer) = self.timer.as_mut() {
                    timer.restart(self.timeout);
                }
                Ok(Evaluation::none())
            }
            Trigger::Timer(wake) => match self.timer.as_mut().map(|timer| timer.fire(wake)) {
                Some(true) => Ok(Evaluation::set(
                    self.config.alarm_severity,
                    format!(
                        "Heartbeat event not seen within timeout of {}s",
                        self.config.timeout
                    ),
                )),
                _ => Ok(Evaluation::Unchanged),
            },
            Trigger::Poll => Ok(Evaluation::Unchanged),
        }
    }

    fn start(&mut self, ctx: &RuleContext) {
        let mut timer = ctx.timer("heartbeat");
        timer.restart(self.timeout);
        self.timer = Some(timer);
    }

    fn stop(&mut self) {
        self.timer = None;
    }
}
