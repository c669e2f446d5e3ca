//! Severity of one float value against ordered threshold levels.

use std::collections::HashMap;

use vigil_core::Severity;

use crate::error::RuleError;

/// Minimum separation between adjacent levels, as a multiple of hysteresis.
pub const HYSTERESIS_GROW_FACTOR: f64 = 1.1;

/// Threshold levels; `None` leaves a severity unused.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Levels {
    pub warning: Option<f64>,
    pub serious: Option<f64>,
    pub critical: Option<f64>,
}

/// Computes `(severity, reason)` for a value against up to three levels.
///
/// When `big_is_bad` is false, values below a level are bad. Internally
/// both directions are handled by flipping the sign of values and levels.
/// A severity is kept until the value falls below its level by more than
/// `hysteresis`.
#[derive(Debug, Clone)]
pub struct ThresholdHandler {
    /// Scaled levels by decreasing severity.
    levels: Vec<(Severity, f64)>,
    hysteresis: f64,
    scale: f64,
    value_name: String,
    units: String,
    messages: HashMap<Severity, String>,
}

impl ThresholdHandler {
    pub fn new(
        levels: Levels,
        hysteresis: f64,
        big_is_bad: bool,
        value_name: impl Into<String>,
        units: impl Into<String>,
    ) -> Result<Self, RuleError> {
        const CLASS: &str = "ThresholdHandler";
        if !hysteresis.is_finite() || hysteresis < 0.0 {
            return Err(RuleError::invalid(
                CLASS,
                format!("hysteresis={hysteresis} must be finite and nonnegative"),
            ));
        }
        let scale = if big_is_bad { 1.0 } else { -1.0 };

        let mut scaled = Vec::new();
        for (severity, level) in [
            (Severity::Critical, levels.critical),
            (Severity::Serious, levels.serious),
            (Severity::Warning, levels.warning),
        ] {
            let Some(level) = level else { continue };
            if !level.is_finite() {
                return Err(RuleError::invalid(
                    CLASS,
                    format!("{}_level={level} must be finite", severity.as_str().to_lowercase()),
                ));
            }
            scaled.push((severity, level * scale));
        }
        if scaled.is_empty() {
            return Err(RuleError::invalid(
                CLASS,
                "at least one of warning_level, serious_level or critical_level must be set",
            ));
        }

        let grown = hysteresis * HYSTERESIS_GROW_FACTOR;
        for pair in scaled.windows(2) {
            let (higher, higher_level) = pair[0];
            let (lower, lower_level) = pair[1];
            let describe = || {
                format!(
                    "{}_level={} and {}_level={}",
                    lower.as_str().to_lowercase(),
                    lower_level * scale,
                    higher.as_str().to_lowercase(),
                    higher_level * scale
                )
            };
            if higher_level <= lower_level {
                return Err(RuleError::invalid(CLASS, format!("{} are out of order", describe())));
            }
            if higher_level - grown <= lower_level {
                return Err(RuleError::invalid(
                    CLASS,
                    format!(
                        "{} are not separated by at least hysteresis={hysteresis} * {HYSTERESIS_GROW_FACTOR}",
                        describe()
                    ),
                ));
            }
        }

        Ok(Self {
            levels: scaled,
            hysteresis,
            scale,
            value_name: value_name.into(),
            units: units.into(),
            messages: HashMap::new(),
        })
    }

    /// Prefix the reason for `severity` with an operator instruction.
    pub fn with_message(mut self, severity: Severity, message: impl Into<String>) -> Self {
        let message = message.into();
        if !message.is_empty() {
            self.messages.insert(severity, message);
        }
        self
    }

    /// Severity and reason for `value`, given the alarm's `current` severity.
    ///
    /// `source` names where the value came from (e.g. a sensor); pass ""
    /// when there is only one possible source.
    pub fn severity_reason(&self, value: f64, current: Severity, source: &str) -> (Severity, String) {
        let scaled_value = value * self.scale;
        for &(severity, scaled_level) in &self.levels {
            if scaled_value > scaled_level {
                return (severity, self.reason(severity, scaled_level, value, false, source));
            }
            if current == severity && scaled_value > scaled_level - self.hysteresis {
                return (severity, self.reason(severity, scaled_level, value, true, source));
            }
        }
        (Severity::None, String::new())
    }

    fn reason(&self, severity: Severity, scaled_level: f64, value: f64, hysteresis: bool, source: &str) -> String {
        let mut reason = String::new();
        if let Some(message) = self.messages.get(&severity) {
            reason.push_str(message);
            reason.push_str(": ");
        }
        let relation = if self.scale > 0.0 { ">" } else { "<" };
        reason.push_str(&format!(
            "{} {value:.2} {} {relation} {:.2}",
            self.value_name,
            self.units,
            scaled_level * self.scale
        ));
        if hysteresis {
            let sign = if self.scale > 0.0 { "-" } else { "+" };
            reason.push_str(&format!(" {sign} hysteresis {:.2}", self.hysteresis));
        }
        if !source.is_empty() {
            reason.push_str(" as reported by ");
            reason.push_str(source);
        }
        reason
    }
}
