//! Rules used to exercise the watcher itself.

use std::time::Duration;

use serde::Deserialize;
use vigil_core::Severity;
use vigil_eisenbahn::{SourceDescriptor, SourceView};

use super::{positive_seconds, seconds};
use crate::error::RuleError;
use crate::registry::parse_config;
use crate::rule::{Evaluation, Rule, Trigger};
use crate::timer::{RuleContext, RuleTimer};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfiguredSeveritiesConfig {
    /// Last field of the rule name.
    pub name: String,
    /// Time between severities (sec).
    pub interval: f64,
    /// Extra delay before the first severity (sec).
    #[serde(default)]
    pub delay: f64,
    pub severities: Vec<Severity>,
    /// Number of passes through `severities`; 0 = forever.
    #[serde(default)]
    pub repeats: u32,
}

/// Steps through a configured list of severities on a timer.
pub struct ConfiguredSeverities {
    name: String,
    interval: Duration,
    delay: Duration,
    config: ConfiguredSeveritiesConfig,
    next: usize,
    passes: u32,
    timer: Option<RuleTimer>,
}

impl ConfiguredSeverities {
    const CLASS: &'static str = "test.ConfiguredSeverities";

    pub fn new(config: ConfiguredSeveritiesConfig) -> Result<Self, RuleError> {
        let interval = positive_seconds(Self::CLASS, "interval", config.interval)?;
        let delay = seconds(Self::CLASS, "delay", config.delay)?;
        if config.severities.is_empty() {
            return Err(RuleError::invalid(Self::CLASS, "severities must have at least one item"));
        }
        Ok(Self {
            name: format!("{}.{}", Self::CLASS, config.name),
            interval,
            delay,
            config,
            next: 0,
            passes: 0,
            timer: None,
        })
    }

    pub fn from_config(value: &serde_yaml::Value) -> Result<Self, RuleError> {
        Self::new(parse_config(Self::CLASS, value)?)
    }
}

impl Rule for ConfiguredSeverities {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[SourceDescriptor] {
        &[]
    }

    fn evaluate(&mut self, trigger: Trigger<'_>, _view: &SourceView<'_>) -> Result<Evaluation, RuleError> {
        let Trigger::Timer(wake) = trigger else {
            return Ok(Evaluation::Unchanged);
        };
        let interval = self.interval;
        let Some(timer) = self.timer.as_mut() else {
            return Ok(Evaluation::Unchanged);
        };
        if !timer.fire(wake) {
            return Ok(Evaluation::Unchanged);
        }

        let severity = self.config.severities[self.next];
        self.next += 1;
        if self.next == self.config.severities.len() {
            self.next = 0;
            self.passes += 1;
        }
        let finished = self.config.repeats > 0 && self.passes >= self.config.repeats;
        if !finished {
            timer.restart(interval);
        }
        Ok(Evaluation::set(severity, "Commanded severity"))
    }

    fn start(&mut self, ctx: &RuleContext) {
        self.next = 0;
        self.passes = 0;
        let mut timer = ctx.timer("step");
        timer.restart(self.delay.saturating_add(self.interval));
        self.timer = Some(timer);
    }

    fn stop(&mut self) {
        self.timer = None;
    }
}

/// A rule with no config and no sources. Never changes its alarm.
pub struct NoConfig;

impl NoConfig {
    const NAME: &'static str = "test.NoConfig";

    /// Accepts only an empty config (`null` or `{}`).
    pub fn from_config(value: &serde_yaml::Value) -> Result<Self, RuleError> {
        let empty = match value {
            serde_yaml::Value::Null => true,
            serde_yaml::Value::Mapping(m) => m.is_empty(),
            _ => false,
        };
        if !empty {
            return Err(RuleError::invalid(Self::NAME, "takes no configuration"));
        }
        Ok(Self)
    }
}

impl Rule for NoConfig {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn sources(&self) -> &[SourceDescriptor] {
        &[]
    }

    fn evaluate(&mut self, _trigger: Trigger<'_>, _view: &SourceView<'_>) -> Result<Evaluation, RuleError> {
        Ok(Evaluation::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use vigil_eisenbahn::TopicDispatcher;

    #[tokio::test(start_paused = true)]
    async fn steps_through_severities_then_stops() {
        let config = "name: a\ninterval: 1\nseverities: [WARNING, 4, NONE]\nrepeats: 1";
        let mut rule = ConfiguredSeverities::from_config(&serde_yaml::from_str(config).unwrap()).unwrap();
        assert_eq!(rule.name(), "test.ConfiguredSeverities.a");
        let dispatcher = TopicDispatcher::new();
        let allowed = Default::default();
        let view = dispatcher.view(&allowed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        rule.start(&RuleContext::new(rule.name().to_string(), tx, Arc::default()));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let wake = rx.recv().await.unwrap();
            match rule.evaluate(Trigger::Timer(&wake), &view).unwrap() {
                Evaluation::Set { severity, .. } => seen.push(severity),
                Evaluation::Unchanged => panic!("expected a severity"),
            }
        }
        assert_eq!(seen, vec![Severity::Warning, Severity::Critical, Severity::None]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn no_config_rejects_config() {
        assert!(NoConfig::from_config(&serde_yaml::Value::Null).is_ok());
        assert!(NoConfig::from_config(&serde_yaml::from_str("{}").unwrap()).is_ok());
        assert!(NoConfig::from_config(&serde_yaml::from_str("a: 1").unwrap()).is_err());
    }
}
