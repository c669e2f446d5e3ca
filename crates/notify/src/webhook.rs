//! Incident webhook escalator.
//!
//! Creates and resolves incidents with JSON POSTs to a single endpoint:
//! `{escalation_url}/v2/incidents/api/{key}`. An incident is accepted only
//! with status 202.

use std::time::Duration;

use serde::Serialize;
use vigil_core::WatcherConfig;

use crate::traits::{Escalator, Incident, NotifyError};

/// Largest request body the incident service accepts.
pub const MAX_PAYLOAD_BYTES: usize = 30_000;

/// Descriptions are cut to this size to stay well inside the body limit.
pub const MAX_DESCRIPTION_BYTES: usize = 15_000;

#[derive(Debug, Serialize)]
struct Tags<'a> {
    responder: &'a str,
    alarm_name: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    message: String,
    description: &'a str,
    tags: Tags<'a>,
    status: &'static str,
    event_id: String,
}

#[derive(Debug, Serialize)]
struct ResolveBody<'a> {
    status: &'static str,
    event_id: &'a str,
}

/// Posts incidents to the incident service.
#[derive(Debug)]
pub struct WebhookEscalator {
    /// Full endpoint including the key (env vars already resolved).
    endpoint: String,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl WebhookEscalator {
    /// `${VAR_NAME}` references in `endpoint` are resolved eagerly; a
    /// missing variable is a [`NotifyError::Config`].
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: resolve_env_vars(endpoint)?,
            client,
        })
    }

    /// Escalator for a watcher config, or `None` if `escalation_url` is empty.
    pub fn from_config(config: &WatcherConfig) -> Result<Option<Self>, NotifyError> {
        let endpoint = config
            .escalation_endpoint()
            .map_err(|e| NotifyError::Config(e.to_string()))?;
        let timeout = config
            .escalation_timeout()
            .map_err(|e| NotifyError::Config(e.to_string()))?;
        endpoint
            .map(|endpoint| Self::new(&endpoint, timeout))
            .transpose()
    }

    async fn post<T: Serialize>(&self, body: &T) -> Result<reqwest::StatusCode, NotifyError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| NotifyError::Config(format!("failed to serialize request: {e}")))?;
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(NotifyError::Oversized { size: bytes.len() });
        }
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout
                } else {
                    NotifyError::Http(e)
                }
            })?;
        let status = response.status();
        if status != reqwest::StatusCode::ACCEPTED {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(status)
    }
}

#[async_trait::async_trait]
impl Escalator for WebhookEscalator {
    async fn create(&self, incident: &Incident) -> Result<(), NotifyError> {
        let body = CreateBody {
            message: format!("Watcher alarm '{}' escalated", incident.alarm_name),
            description: truncate(&incident.reason, MAX_DESCRIPTION_BYTES),
            tags: Tags {
                responder: &incident.responder,
                alarm_name: &incident.alarm_name,
            },
            status: "trigger",
            event_id: incident.event_id.to_string(),
        };
        if let Err(e) = self.post(&body).await {
            tracing::warn!(alarm = %incident.alarm_name, error = %e, "incident create failed");
            return Err(e);
        }
        tracing::info!(
            alarm = %incident.alarm_name,
            responder = %incident.responder,
            event_id = %incident.event_id,
            "incident created"
        );
        Ok(())
    }

    async fn resolve(&self, event_id: &str) -> Result<(), NotifyError> {
        self.post(&ResolveBody {
            status: "resolve",
            event_id,
        })
        .await?;
        tracing::debug!(event_id, "incident resolved");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Resolve `${VAR_NAME}` patterns in a string using `std::env::var`.
///
/// Returns an error if a referenced variable is not set.
fn resolve_env_vars(input: &str) -> Result<String, NotifyError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_name.push(c);
            }
            if !closed {
                return Err(NotifyError::Config(format!(
                    "unclosed env var reference in: {input}"
                )));
            }
            let value = std::env::var(&var_name)
                .map_err(|_| NotifyError::Config(format!("env var not found: {var_name}")))?;
            result.push_str(&value);
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}
