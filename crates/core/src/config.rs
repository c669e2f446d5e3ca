use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// URL suffix for the incident webhook API.
pub const INCIDENT_WEBHOOK_URL_SUFFIX: &str = "/v2/incidents/api/";

/// Env var holding the incident webhook key.
pub const ESCALATION_KEY_ENV: &str = "ESCALATION_KEY";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_f64(key: &str) -> Option<f64> {
    env_opt(key).and_then(|v| v.parse().ok())
}

fn default_auto_delay() -> f64 {
    3600.0
}

fn default_escalation_timeout() -> f64 {
    5.0
}

// ── Top-level config ──────────────────────────────────────────

/// Watcher configuration: the rule set plus alarm-wide delays and escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatcherConfig {
    /// Data sources to ignore, as `name` or `name:index` (index defaults to 0).
    /// Rules that need a disabled source are skipped.
    #[serde(default)]
    pub disabled_sources: Vec<String>,

    /// Delay (sec) before a stale alarm is automatically acknowledged; 0 = never.
    #[serde(default = "default_auto_delay")]
    pub auto_acknowledge_delay: f64,

    /// Delay (sec) before an acknowledged alarm is automatically
    /// unacknowledged; 0 = never.
    #[serde(default = "default_auto_delay")]
    pub auto_unacknowledge_delay: f64,

    pub rules: Vec<RuleSet>,

    /// Escalation routes; each alarm uses the first entry that matches it.
    #[serde(default)]
    pub escalation: Vec<EscalationEntry>,

    /// Base URL of the incident service. Empty disables escalation calls.
    #[serde(default)]
    pub escalation_url: String,

    /// Timeout (sec) for each incident service request.
    #[serde(default = "default_escalation_timeout")]
    pub escalation_timeout: f64,
}

/// One rule class and the configuration of each of its instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSet {
    /// Rule class name, e.g. `Heartbeat` or `test.NoConfig`.
    pub classname: String,
    pub configs: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationEntry {
    /// Case-blind glob expressions that must match the full alarm name.
    pub alarms: Vec<String>,
    /// Responder to escalate to. Empty disables escalation.
    pub to: String,
    /// Delay (sec) after the alarm first goes critical. 0 disables escalation.
    pub delay: f64,
}

impl WatcherConfig {
    /// Parse config from a YAML string, apply env overrides and validate.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `VIGIL_KEY` overrides `key`:
    /// - `VIGIL_AUTO_ACKNOWLEDGE_DELAY`
    /// - `VIGIL_AUTO_UNACKNOWLEDGE_DELAY`
    /// - `VIGIL_ESCALATION_URL`
    /// - `VIGIL_ESCALATION_TIMEOUT`
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_f64("VIGIL_AUTO_ACKNOWLEDGE_DELAY") {
            self.auto_acknowledge_delay = v;
        }
        if let Some(v) = env_f64("VIGIL_AUTO_UNACKNOWLEDGE_DELAY") {
            self.auto_unacknowledge_delay = v;
        }
        if let Some(v) = env_opt("VIGIL_ESCALATION_URL") {
            self.escalation_url = v;
        }
        if let Some(v) = env_f64("VIGIL_ESCALATION_TIMEOUT") {
            self.escalation_timeout = v;
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.auto_acknowledge_delay()?;
        self.auto_unacknowledge_delay()?;
        if self.escalation_timeout()?.is_zero() {
            return Err(CoreError::Validation(
                "escalation_timeout must be positive".into(),
            ));
        }
        for (i, rule_set) in self.rules.iter().enumerate() {
            if rule_set.classname.trim().is_empty() {
                return Err(CoreError::Validation(format!("rules[{i}]: empty classname")));
            }
            if rule_set.configs.is_empty() {
                return Err(CoreError::Validation(format!(
                    "rules[{i}] ({}): configs must have at least one item",
                    rule_set.classname
                )));
            }
        }
        for (i, entry) in self.escalation.iter().enumerate() {
            if entry.alarms.is_empty() {
                return Err(CoreError::Validation(format!(
                    "escalation[{i}]: alarms must have at least one item"
                )));
            }
            seconds(&format!("escalation[{i}].delay"), entry.delay)?;
        }
        Ok(())
    }

    pub fn auto_acknowledge_delay(&self) -> Result<Duration, CoreError> {
        seconds("auto_acknowledge_delay", self.auto_acknowledge_delay)
    }

    pub fn auto_unacknowledge_delay(&self) -> Result<Duration, CoreError> {
        seconds("auto_unacknowledge_delay", self.auto_unacknowledge_delay)
    }

    pub fn escalation_timeout(&self) -> Result<Duration, CoreError> {
        seconds("escalation_timeout", self.escalation_timeout)
    }

    /// Full incident webhook endpoint, or `None` if escalation calls are disabled.
    ///
    /// The key is read from `ESCALATION_KEY`, which must be set whenever
    /// `escalation_url` is.
    pub fn escalation_endpoint(&self) -> Result<Option<String>, CoreError> {
        if self.escalation_url.is_empty() {
            return Ok(None);
        }
        let key = env_opt(ESCALATION_KEY_ENV)
            .ok_or_else(|| CoreError::MissingEnv(ESCALATION_KEY_ENV.to_string()))?;
        Ok(Some(format!(
            "{}{}{}",
            self.escalation_url.trim_end_matches('/'),
            INCIDENT_WEBHOOK_URL_SUFFIX,
            key
        )))
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let instances: usize = self.rules.iter().map(|r| r.configs.len()).sum();
        tracing::info!("Watcher config loaded:");
        tracing::info!("  rules:       {} classes, {} instances", self.rules.len(), instances);
        tracing::info!("  disabled:    {:?}", self.disabled_sources);
        tracing::info!(
            "  auto delays: ack={}s unack={}s",
            self.auto_acknowledge_delay,
            self.auto_unacknowledge_delay
        );
        tracing::info!(
            "  escalation:  {} routes, url={}",
            self.escalation.len(),
            if self.escalation_url.is_empty() { "(none)" } else { &self.escalation_url }
        );
    }
}

/// Convert a config value in seconds to a [`Duration`].
///
/// Rejects negative, non-finite and out-of-range values, and positive
/// values too small to be represented (they would silently become zero).
pub fn seconds(name: &str, value: f64) -> Result<Duration, CoreError> {
    let duration = Duration::try_from_secs_f64(value)
        .map_err(|_| CoreError::Validation(format!("{name}={value} is not a valid delay (sec)")))?;
    if value > 0.0 && duration.is_zero() {
        return Err(CoreError::Validation(format!("{name}={value} is too small")));
    }
    Ok(duration)
}
