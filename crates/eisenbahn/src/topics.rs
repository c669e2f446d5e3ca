//! Wire topic naming for PUB/SUB routing.
//!
//! Topics follow the pattern `vigil.<domain>.<key>` so subscribers can
//! filter by prefix.

use crate::error::EisenbahnError;
use crate::source::{SourceKey, TopicKey};

/// Prefix of every inbound data sample.
pub const SAMPLE_PREFIX: &str = "vigil.sample.";

/// Prefix of every published alarm state change.
pub const ALARM_PREFIX: &str = "vigil.alarm.";

/// Wire topic for samples of one source topic: `vigil.sample.ESS:1/temperature`.
pub fn sample_topic(topic: &TopicKey) -> String {
    format!("{SAMPLE_PREFIX}{topic}")
}

/// Wire topic prefix matching every topic of one source connection.
pub fn source_prefix(source: &SourceKey) -> String {
    format!("{SAMPLE_PREFIX}{source}/")
}

/// Wire topic for one alarm's state changes.
pub fn alarm_topic(alarm_name: &str) -> String {
    format!("{ALARM_PREFIX}{alarm_name}")
}

/// Parse a sample wire topic back into a [`TopicKey`].
pub fn parse_sample_topic(wire: &str) -> Result<TopicKey, EisenbahnError> {
    let rest = wire
        .strip_prefix(SAMPLE_PREFIX)
        .ok_or_else(|| EisenbahnError::InvalidTopic(wire.to_string()))?;
    let (source, topic) = rest
        .split_once('/')
        .ok_or_else(|| EisenbahnError::InvalidTopic(wire.to_string()))?;
    if topic.is_empty() {
        return Err(EisenbahnError::InvalidTopic(wire.to_string()));
    }
    Ok(SourceKey::parse(source)?.topic(topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_topic_roundtrip() {
        let key = SourceKey::new("ESS", 1).topic("temperature");
        let wire = sample_topic(&key);
        assert_eq!(wire, "vigil.sample.ESS:1/temperature");
        assert_eq!(parse_sample_topic(&wire).unwrap(), key);
        assert!(wire.starts_with(&source_prefix(&key.source)));
    }

    #[test]
    fn parse_rejects_foreign_topics() {
        assert!(parse_sample_topic("vigil.alarm.Heartbeat.ATDome:0").is_err());
        assert!(parse_sample_topic("vigil.sample.ESS:1").is_err());
        assert!(parse_sample_topic("vigil.sample.ESS:1/").is_err());
    }
}
