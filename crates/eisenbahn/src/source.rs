//! Data source identities and the samples they deliver.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EisenbahnError;

/// Identity of a shared data-source connection: `(component, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub component: String,
    pub index: u32,
}

impl SourceKey {
    pub fn new(component: impl Into<String>, index: u32) -> Self {
        Self {
            component: component.into(),
            index,
        }
    }

    /// Parse `name` or `name:index`; the index defaults to 0.
    pub fn parse(name: &str) -> Result<Self, EisenbahnError> {
        let name = name.trim();
        let (component, index) = match name.split_once(':') {
            Some((component, index)) => {
                let index = index
                    .parse::<u32>()
                    .map_err(|_| EisenbahnError::InvalidSource(name.to_string()))?;
                (component, index)
            }
            None => (name, 0),
        };
        if component.is_empty() || component.contains(['/', ' ']) {
            return Err(EisenbahnError::InvalidSource(name.to_string()));
        }
        Ok(Self::new(component, index))
    }

    /// Key for one topic of this source.
    pub fn topic(&self, topic: impl Into<String>) -> TopicKey {
        TopicKey {
            source: self.clone(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component, self.index)
    }
}

impl FromStr for SourceKey {
    type Err = EisenbahnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity of one subscription: a topic on a shared connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicKey {
    pub source: SourceKey,
    pub topic: String,
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.topic)
    }
}

/// How a rule wants to be driven by one of its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Evaluate once per inbound sample.
    Callback,
    /// Evaluate on a fixed interval; the rule reads the latest value itself.
    Poll { interval: Duration },
}

/// A rule's declaration of one topic it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub topic: TopicKey,
    pub mode: DeliveryMode,
}

impl SourceDescriptor {
    pub fn callback(source: &SourceKey, topic: impl Into<String>) -> Self {
        Self {
            topic: source.topic(topic),
            mode: DeliveryMode::Callback,
        }
    }

    pub fn poll(source: &SourceKey, topic: impl Into<String>, interval: Duration) -> Self {
        Self {
            topic: source.topic(topic),
            mode: DeliveryMode::Poll { interval },
        }
    }

    pub fn source(&self) -> &SourceKey {
        &self.topic.source
    }
}

/// One inbound data sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub topic: TopicKey,
    pub data: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(topic: TopicKey, data: serde_json::Value) -> Self {
        Self {
            topic,
            data,
            received_at: Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(serde_json::Value::as_f64)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(serde_json::Value::as_i64)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(serde_json::Value::as_str)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.field(name).and_then(serde_json::Value::as_bool)
    }

    /// Render a scalar field as a string key (used by filtered topics).
    pub fn field_key(&self, name: &str) -> Option<String> {
        match self.field(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_name_and_index() {
        assert_eq!(SourceKey::parse("ESS:5").unwrap(), SourceKey::new("ESS", 5));
        assert_eq!(SourceKey::parse("ATDome").unwrap(), SourceKey::new("ATDome", 0));
        assert!(SourceKey::parse("ESS:x").is_err());
        assert!(SourceKey::parse(":3").is_err());
    }

    #[test]
    fn display_forms() {
        let key = SourceKey::new("MTMount", 0);
        assert_eq!(key.to_string(), "MTMount:0");
        assert_eq!(key.topic("heartbeat").to_string(), "MTMount:0/heartbeat");
    }

    #[test]
    fn sample_field_accessors() {
        let sample = Sample::new(
            SourceKey::new("ESS", 1).topic("temperature"),
            json!({"sensorName": "dome", "value": 12.5, "count": 3, "ok": true}),
        );
        assert_eq!(sample.f64("value"), Some(12.5));
        assert_eq!(sample.i64("count"), Some(3));
        assert_eq!(sample.str("sensorName"), Some("dome"));
        assert_eq!(sample.bool("ok"), Some(true));
        assert_eq!(sample.field_key("count").as_deref(), Some("3"));
        assert_eq!(sample.f64("missing"), None);
    }
}
