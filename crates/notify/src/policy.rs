//! Escalation routing by alarm name.
//!
//! Routes are checked in order and the first one with a glob matching the
//! whole alarm name (ignoring case) wins. Matching happens once per alarm
//! when the engine is configured.

use std::time::Duration;

use regex::Regex;
use vigil_core::{seconds, EscalationEntry};

use crate::traits::NotifyError;

/// Where and when to escalate one alarm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub responder: String,
    pub delay: Duration,
}

impl EscalationPolicy {
    /// A zero delay or empty responder means never escalate.
    pub fn is_active(&self) -> bool {
        !self.responder.is_empty() && !self.delay.is_zero()
    }
}

#[derive(Debug, Clone)]
struct Route {
    patterns: Vec<Regex>,
    policy: EscalationPolicy,
}

/// Ordered escalation routes.
#[derive(Debug, Clone, Default)]
pub struct EscalationTable {
    routes: Vec<Route>,
}

impl EscalationTable {
    pub fn new(entries: &[EscalationEntry]) -> Result<Self, NotifyError> {
        let mut routes = Vec::with_capacity(entries.len());
        for entry in entries {
            let patterns = entry
                .alarms
                .iter()
                .map(|glob| {
                    Regex::new(&glob_to_regex(glob))
                        .map_err(|e| NotifyError::Config(format!("bad alarm glob {glob:?}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let delay = seconds("delay", entry.delay)
                .map_err(|e| NotifyError::Config(e.to_string()))?;
            routes.push(Route {
                patterns,
                policy: EscalationPolicy {
                    responder: entry.to.clone(),
                    delay,
                },
            });
        }
        Ok(Self { routes })
    }

    /// Policy of the first matching route, or an inactive policy.
    pub fn policy_for(&self, alarm_name: &str) -> EscalationPolicy {
        self.routes
            .iter()
            .find(|r| r.patterns.iter().any(|p| p.is_match(alarm_name)))
            .map(|r| r.policy.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Translate a shell glob into a case-insensitive, fully anchored regex.
///
/// Supports `*`, `?`, `[abc]` and `[!abc]`; an unclosed `[` is literal.
pub fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("(?i)^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i + 1;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str(r"\[");
                } else {
                    let inner: String = chars[i + 1..j].iter().collect();
                    let negate = inner.starts_with('!');
                    let inner = if negate { &inner[1..] } else { inner.as_str() };
                    out.push('[');
                    if negate {
                        out.push('^');
                    }
                    for c in inner.chars() {
                        if matches!(c, '\\' | '[' | '^') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push(']');
                    i = j;
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}
