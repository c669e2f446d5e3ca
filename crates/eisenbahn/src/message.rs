use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EisenbahnError;
use crate::source::Sample;
use crate::topics;

/// Wire envelope for samples and alarm events.
///
/// Envelopes are MessagePack encoded. `topic` carries the wire topic used
/// for PUB/SUB prefix filtering; `payload` is itself MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Wire topic, e.g. `vigil.sample.ESS:1/temperature`.
    pub topic: String,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// When the sender created this envelope.
    pub timestamp: DateTime<Utc>,

    pub id: Uuid,

    /// Payload schema version. Receivers skip versions they do not know.
    #[serde(default = "default_version")]
    pub version: u16,
}

/// Current payload schema version.
pub const VERSION: u16 = 1;

fn default_version() -> u16 {
    VERSION
}

impl Message {
    /// Create a new envelope, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, EisenbahnError> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec_named(payload)?,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            version: VERSION,
        })
    }

    /// Envelope carrying the data of one sample on its wire topic.
    pub fn sample(sample: &Sample) -> Result<Self, EisenbahnError> {
        let mut message = Self::new(topics::sample_topic(&sample.topic), &sample.data)?;
        message.timestamp = sample.received_at;
        Ok(message)
    }

    /// Decode a sample envelope. The receive time is the envelope timestamp.
    pub fn into_sample(self) -> Result<Sample, EisenbahnError> {
        let topic = topics::parse_sample_topic(&self.topic)?;
        let data: serde_json::Value = self.decode()?;
        Ok(Sample {
            topic,
            data,
            received_at: self.timestamp,
        })
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EisenbahnError> {
        if self.version != VERSION {
            return Err(EisenbahnError::Transport(format!(
                "unsupported message version {} on {}",
                self.version, self.topic
            )));
        }
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    /// Serialize the whole envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EisenbahnError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EisenbahnError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Serde helper so `Vec<u8>` is written as a MessagePack bin, not an array.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKey;
    use serde_json::json;

    #[test]
    fn sample_envelope_survives_the_wire() {
        let sample = Sample::new(
            SourceKey::new("ESS", 1).topic("temperature"),
            json!({"sensorName": "dome", "temperature": [12.5, 13.0], "location": "upper"}),
        );
        let bytes = Message::sample(&sample).unwrap().to_bytes().unwrap();

        let message = Message::from_bytes(&bytes).unwrap();
        assert_eq!(message.topic, "vigil.sample.ESS:1/temperature");

        let decoded = message.into_sample().unwrap();
        assert_eq!(decoded.topic, sample.topic);
        assert_eq!(decoded.data, sample.data);
        assert_eq!(decoded.received_at, sample.received_at);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut message = Message::new("vigil.alarm.x", &42u64).unwrap();
        message.version = 7;
        assert!(message.decode::<u64>().is_err());
    }

    #[test]
    fn non_sample_topic_is_not_a_sample() {
        let message = Message::new("vigil.alarm.Heartbeat.ATDome:0", &json!({})).unwrap();
        assert!(message.into_sample().is_err());
    }
}
