
use serde::Deserialize;
use vigil_core::Severity;
use vigil_eisenbahn::{SetupView, SourceDescriptor, SourceView, TopicKey};

use super::{positive_seconds, source_key};
use crate::error::RuleError;
use crate::registry::parse_config;
use crate::rule::{Evaluation, Rule, Trigger};
use crate::threshold::{Levels, ThresholdHandler};

const CLASS: &str = "Threshold";

fn default_poll_interval() -> f64 {
    1.0
}

fn default_big_is_bad() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdRuleConfig {
    /// Component as `name` or `name:index`.
    pub name: String,
    pub topic: String,
    /// Numeric field to check.
    pub field: String,
    /// Only consider samples whose `filter_field` equals `filter_value`.
    /// Needed for topics multiplexed over several sensors.
    #[serde(default)]
    pub filter_field: Option<String>,
    #[serde(default)]
    pub filter_value: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default)]
    pub warning_level: Option<f64>,
    #[serde(default)]
    pub serious_level: Option<f64>,
    #[serde(default)]
    pub critical_level: Option<f64>,
    #[serde(default)]
    pub hysteresis: f64,
    #[serde(default = "default_big_is_bad")]
    pub big_is_bad: bool,
    #[serde(default)]
    pub units: String,
    /// Instruction shown ahead of the reason, e.g. "Close the dome".
    #[serde(default)]
    pub message: String,
}

/// Poll-driven check of one numeric field against threshold levels.
pub struct ThresholdRule {
    name: String,
    sources: Vec<SourceDescriptor>,
    topic: TopicKey,
    field: String,
    filter: Option<(String, String)>,
    handler: ThresholdHandler,
    /// Severity last reported, for hysteresis.
    current: Severity,
}

impl ThresholdRule {
    pub fn new(config: ThresholdRuleConfig) -> Result<Self, RuleError> {
        let source = source_key(CLASS, &config.name)?;
        let interval = positive_seconds(CLASS, "poll_interval", config.poll_interval)?;
        let filter = match (config.filter_field, config.filter_value) {
            (Some(field), Some(value)) => Some((field, value)),
            (None, None) => None,
            _ => {
                return Err(RuleError::invalid(
                    CLASS,
                    "filter_field and filter_value must be given together",
                ))
            }
        };
        let levels = Levels {
            warning: config.warning_level,
            serious: config.serious_level,
            critical: config.critical_level,
        };
        let mut handler = ThresholdHandler::new(
            levels,
            config.hysteresis,
            config.big_is_bad,
            config.field.as_str(),
            config.units,
        )
        .map_err(|e| RuleError::invalid(CLASS, e.to_string()))?;
        for severity in [Severity::Warning, Severity::Serious, Severity::Critical] {
            handler = handler.with_message(severity, config.message.as_str());
        }

        let mut name = format!("{CLASS}.{source}.{}.{}", config.topic, config.field);
        if let Some((_, value)) = &filter {
            name.push('.');
            name.push_str(value);
        }
        Ok(Self {
            name,
            sources: vec![SourceDescriptor::poll(&source, config.topic.as_str(), interval)],
            topic: source.topic(config.topic),
            field: config.field,
            filter,
            handler,
            current: Severity::None,
        })
    }

    pub fn from_config(value: &serde_yaml::Value) -> Result<Self, RuleError> {
        Self::new(parse_config(CLASS, value)?)
    }
}

impl Rule for ThresholdRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    fn setup(&mut self, view: &mut SetupView<'_>) -> Result<(), RuleError> {
        if let Some((field, _)) = &self.filter {
            view.filter(&self.topic, field)?;
        }
        Ok(())
    }

    fn evaluate(&mut self, trigger: Trigger<'_>, view: &SourceView<'_>) -> Result<Evaluation, RuleError> {
        if !matches!(trigger, Trigger::Poll) {
            return Ok(Evaluation::Unchanged);
        }
        let sample = match &self.filter {
            Some((field, value)) => view.latest_filtered(&self.topic, field, value)?,
            None => view.latest(&self.topic)?,
        };
        // No data yet.
        let Some(sample) = sample else {
            return Ok(Evaluation::Unchanged);
        };
        let value = sample.f64(&self.field).ok_or_else(|| {
            RuleError::Evaluation(format!("{} has no numeric field {:?}", sample.topic, self.field))
        })?;
        let source = self.filter.as_ref().map_or("", |(_, v)| v.as_str());
        let (severity, reason) = self.handler.severity_reason(value, self.current, source);
        self.current = severity;
        Ok(Evaluation::set(severity, reason))
    }

    fn stop(&mut self) {
        self.current = Severity::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vigil_eisenbahn::{Sample, SourceKey, TopicDispatcher};

    const CONFIG: &str = "
name: ESS:1
topic: temperature
field: value
filter_field: sensorName
filter_value: dome
warning_level: 20
critical_level: 30
hysteresis: 1
units: C
";

    #[test]
    fn polls_filtered_value() {
        let mut rule = ThresholdRule::from_config(&serde_yaml::from_str(CONFIG).unwrap()).unwrap();
        assert_eq!(rule.name(), "Threshold.ESS:1.temperature.value.dome");

        let mut dispatcher = TopicDispatcher::new();
        let allowed = dispatcher.register(0, rule.sources());
        rule.setup(&mut dispatcher.setup_view(&allowed)).unwrap();

        assert_eq!(
            rule.evaluate(Trigger::Poll, &dispatcher.view(&allowed)).unwrap(),
            Evaluation::Unchanged
        );

        let topic = SourceKey::new("ESS", 1).topic("temperature");
        dispatcher.ingest(Sample::new(topic.clone(), json!({"sensorName": "dome", "value": 25.0})));
        dispatcher.ingest(Sample::new(topic.clone(), json!({"sensorName": "floor", "value": 40.0})));

        assert_eq!(
            rule.evaluate(Trigger::Poll, &dispatcher.view(&allowed)).unwrap(),
            Evaluation::set(Severity::Warning, "value 25.00 C > 20.00 as reported by dome")
        );

        dispatcher.ingest(Sample::new(topic, json!({"sensorName": "dome", "value": 19.5})));
        match rule.evaluate(Trigger::Poll, &dispatcher.view(&allowed)).unwrap() {
            Evaluation::Set { severity, reason } => {
                assert_eq!(severity, Severity::Warning);
                assert!(reason.contains("hysteresis"));
            }
            Evaluation::Unchanged => panic!("expected a severity"),
        }
    }

    #[test]
    fn non_numeric_value_is_an_evaluation_error() {
        let config = "name: ESS\ntopic: t\nfield: value\nwarning_level: 1";
        let mut rule = ThresholdRule::from_config(&serde_yaml::from_str(config).unwrap()).unwrap();
        let mut dispatcher = TopicDispatcher::new();
        let allowed = dispatcher.register(0, rule.sources());
        dispatcher.ingest(Sample::new(SourceKey::new("ESS", 0).topic("t"), json!({"value": "hot"})));
        assert!(matches!(
            rule.evaluate(Trigger::Poll, &dispatcher.view(&allowed)),
            Err(RuleError::Evaluation(_))
        ));
    }

    #[test]
    fn half_filter_rejected() {
        let config = "name: ESS\ntopic: t\nfield: value\nwarning_level: 1\nfilter_field: sensorName";
        assert!(ThresholdRule::from_config(&serde_yaml::from_str(config).unwrap()).is_err());
    }
}
