//! Escalator trait definition and shared error types.

use uuid::Uuid;

/// Errors that can occur while talking to the incident service.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timed out waiting for escalation service")]
    Timeout,

    #[error("escalation service returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("payload of {size} bytes is too large")]
    Oversized { size: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// One incident to open for an escalated alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    pub alarm_name: String,
    pub responder: String,
    /// Alarm reason at escalation time.
    pub reason: String,
    /// Identifies the incident for a later resolve.
    pub event_id: Uuid,
}

impl Incident {
    pub fn new(alarm_name: impl Into<String>, responder: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            alarm_name: alarm_name.into(),
            responder: responder.into(),
            reason: reason.into(),
            event_id: Uuid::new_v4(),
        }
    }
}

/// The external incident service.
///
/// Neither call is retried; callers record failures and move on.
#[async_trait::async_trait]
pub trait Escalator: Send + Sync {
    async fn create(&self, incident: &Incident) -> Result<(), NotifyError>;

    /// Resolve every incident opened with `event_id`. Unknown ids succeed.
    async fn resolve(&self, event_id: &str) -> Result<(), NotifyError>;

    /// Human-readable name for logs (e.g. "webhook").
    fn channel_name(&self) -> &str;
}

/// Used when no incident service is configured: every create fails, so the
/// alarm shows why nothing was escalated.
#[derive(Debug, Default)]
pub struct DisabledEscalator;

#[async_trait::async_trait]
impl Escalator for DisabledEscalator {
    async fn create(&self, _incident: &Incident) -> Result<(), NotifyError> {
        Err(NotifyError::Config("no escalation_url configured".into()))
    }

    async fn resolve(&self, _event_id: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "disabled"
    }
}
