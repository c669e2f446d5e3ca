use std::collections::HashSet;

use vigil_core::Severity;
use vigil_eisenbahn::{Sample, SetupView, SourceDescriptor, SourceKey, SourceView};

use crate::error::RuleError;
use crate::timer::{RuleContext, RuleWake};

/// What caused an evaluation.
#[derive(Debug, Clone, Copy)]
pub enum Trigger<'a> {
    /// A sample arrived on a callback-mode topic the rule declared.
    Sample(&'a Sample),
    /// The poll interval elapsed.
    Poll,
    /// One of the rule's own timers fired.
    Timer(&'a RuleWake),
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Leave the alarm alone.
    Unchanged,
    Set { severity: Severity, reason: String },
}

impl Evaluation {
    /// Condition cleared. Differs from [`Evaluation::Unchanged`]: it is
    /// applied to the alarm.
    pub fn none() -> Self {
        Self::Set {
            severity: Severity::None,
            reason: String::new(),
        }
    }

    pub fn set(severity: Severity, reason: impl Into<String>) -> Self {
        if severity.is_none() {
            return Self::none();
        }
        Self::Set {
            severity,
            reason: reason.into(),
        }
    }
}

/// A pluggable unit producing the severity of exactly one alarm.
///
/// Evaluations run on the engine loop and must not block.
pub trait Rule: Send {
    /// Rule name, which is also the name of its alarm.
    fn name(&self) -> &str;

    /// Topics this rule needs. Evaluations may only read these.
    fn sources(&self) -> &[SourceDescriptor];

    /// Whether the rule can run when `disabled` sources are unavailable.
    fn is_usable(&self, disabled: &HashSet<SourceKey>) -> bool {
        self.sources().iter().all(|d| !disabled.contains(d.source()))
    }

    /// Called once after every connection exists and before data flows.
    fn setup(&mut self, _view: &mut SetupView<'_>) -> Result<(), RuleError> {
        Ok(())
    }

    fn evaluate(&mut self, trigger: Trigger<'_>, view: &SourceView<'_>) -> Result<Evaluation, RuleError>;

    /// Start background timers, if any.
    fn start(&mut self, _ctx: &RuleContext) {}

    /// Cancel background timers.
    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_none_clears_reason() {
        assert_eq!(Evaluation::set(Severity::None, "ignored"), Evaluation::none());
        assert_eq!(
            Evaluation::set(Severity::Warning, "warm"),
            Evaluation::Set {
                severity: Severity::Warning,
                reason: "warm".into()
            }
        );
    }
}
