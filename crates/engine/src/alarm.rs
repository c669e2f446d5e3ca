//! Alarm state machine.
//!
//! An [`Alarm`] is plain synchronous state owned by the model task. Its
//! timers (escalation, auto-acknowledge, auto-unacknowledge, unmute) are
//! tokio tasks that only send an [`AlarmWake`] back to the model; the model
//! hands the wake to [`Alarm::handle_wake`], which checks that the wake
//! belongs to the current arming and that the condition that armed it still
//! holds before acting. Outbound incident calls are queued as
//! [`AlarmEffect`]s for the model to run.
//!
//! States are derived from fields:
//! - Nominal: `severity == NONE && max_severity == NONE`
//! - Active: `severity > NONE`, unacknowledged
//! - Stale: `severity == NONE && max_severity > NONE`, unacknowledged
//! - Acknowledged: `acknowledged == true` (only while `max_severity > NONE`)
//! - Muted: orthogonal to the above

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::Severity;
use vigil_notify::{EscalationPolicy, Incident};

use crate::error::EngineError;

/// User recorded for acknowledgements made by the auto-acknowledge timer.
pub const AUTOMATIC_USER: &str = "automatic";

/// Prefix of `escalated_id` when an incident could not be created.
pub const FAILED_PREFIX: &str = "Failed: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmTimer {
    Escalate,
    AutoAcknowledge,
    AutoUnacknowledge,
    Unmute,
}

/// An alarm timer firing, delivered to the model task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmWake {
    pub alarm: String,
    pub timer: AlarmTimer,
    pub generation: u64,
}

/// Outbound work requested by an alarm transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmEffect {
    /// Open an incident. The result comes back through
    /// [`Alarm::escalation_finished`].
    Escalate(Incident),
    /// Resolve the incidents opened with this event id. Best effort.
    Resolve(String),
}

/// Published alarm state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub name: String,
    pub severity: Severity,
    pub max_severity: Severity,
    pub reason: String,
    pub acknowledged: bool,
    pub acknowledged_by: String,
    pub muted_until: Option<DateTime<Utc>>,
    pub muted_by: String,
    /// Severity above which the alarm unmutes itself; NONE if not muted.
    pub muted_severity: Severity,
    pub escalated_id: String,
    pub escalate_at: Option<DateTime<Utc>>,
}

impl AlarmEvent {
    pub fn is_nominal(&self) -> bool {
        self.severity.is_none() && self.max_severity.is_none()
    }

    pub fn is_muted(&self) -> bool {
        !self.muted_severity.is_none()
    }
}

/// Per-alarm delays and escalation policy.
#[derive(Debug, Clone, Default)]
pub struct AlarmSettings {
    /// Zero disables auto-acknowledge.
    pub auto_acknowledge_delay: Duration,
    /// Zero disables auto-unacknowledge.
    pub auto_unacknowledge_delay: Duration,
    pub escalation: EscalationPolicy,
}

/// Spawns alarm timers that report back on one channel.
#[derive(Debug, Clone)]
pub struct TimerHub {
    wakes: mpsc::UnboundedSender<AlarmWake>,
    generations: Arc<AtomicU64>,
}

impl TimerHub {
    pub fn new(wakes: mpsc::UnboundedSender<AlarmWake>) -> Self {
        Self {
            wakes,
            generations: Arc::default(),
        }
    }

    fn arm(&self, alarm: &str, timer: AlarmTimer, delay: Duration) -> ArmedTimer {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let wake = AlarmWake {
            alarm: alarm.to_string(),
            timer,
            generation,
        };
        let wakes = self.wakes.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wakes.send(wake);
        });
        ArmedTimer { generation, handle }
    }
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn deadline(delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
}

/// One named alarm.
#[derive(Debug)]
pub struct Alarm {
    name: String,
    settings: AlarmSettings,
    hub: TimerHub,

    severity: Severity,
    max_severity: Severity,
    reason: String,
    acknowledged: bool,
    acknowledged_by: String,
    /// Severity at acknowledgement; rising above it unacknowledges.
    ack_severity: Severity,
    muted_until: Option<DateTime<Utc>>,
    muted_by: String,
    muted_severity: Severity,
    escalated_id: String,
    escalate_at: Option<DateTime<Utc>>,
    /// Event id of an incident create still in flight.
    pending_escalation: Option<Uuid>,

    timers: HashMap<AlarmTimer, ArmedTimer>,
    effects: Vec<AlarmEffect>,
    published: Option<AlarmEvent>,
}

impl Alarm {
    pub fn new(name: impl Into<String>, settings: AlarmSettings, hub: TimerHub) -> Self {
        Self {
            name: name.into(),
            settings,
            hub,
            severity: Severity::None,
            max_severity: Severity::None,
            reason: String::new(),
            acknowledged: false,
            acknowledged_by: String::new(),
            ack_severity: Severity::None,
            muted_until: None,
            muted_by: String::new(),
            muted_severity: Severity::None,
            escalated_id: String::new(),
            escalate_at: None,
            pending_escalation: None,
            timers: HashMap::new(),
            effects: Vec::new(),
            published: None,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn max_severity(&self) -> Severity {
        self.max_severity
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn escalated_id(&self) -> &str {
        &self.escalated_id
    }

    pub fn escalation_policy(&self) -> &EscalationPolicy {
        &self.settings.escalation
    }

    pub fn is_nominal(&self) -> bool {
        self.severity.is_none() && self.max_severity.is_none()
    }

    pub fn is_stale(&self) -> bool {
        self.severity.is_none() && !self.max_severity.is_none() && !self.acknowledged
    }

    pub fn is_muted(&self) -> bool {
        !self.muted_severity.is_none()
    }

    pub fn is_armed(&self, timer: AlarmTimer) -> bool {
        self.timers.contains_key(&timer)
    }

    pub fn snapshot(&self) -> AlarmEvent {
        AlarmEvent {
            name: self.name.clone(),
            severity: self.severity,
            max_severity: self.max_severity,
            reason: self.reason.clone(),
            acknowledged: self.acknowledged,
            acknowledged_by: self.acknowledged_by.clone(),
            muted_until: self.muted_until,
            muted_by: self.muted_by.clone(),
            muted_severity: self.muted_severity,
            escalated_id: self.escalated_id.clone(),
            escalate_at: self.escalate_at,
        }
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Apply a rule outcome. Returns `false` if nothing changed.
    pub fn set_severity(&mut self, severity: Severity, reason: impl Into<String>) -> bool {
        let reason = if severity.is_none() {
            String::new()
        } else {
            reason.into()
        };
        if severity == self.severity && reason == self.reason {
            return false;
        }
        let old_max = self.max_severity;
        self.severity = severity;
        self.reason = reason;

        if severity.is_none() {
            if self.acknowledged {
                // Resolved while acknowledged: nothing left to track.
                self.clear_acknowledgement();
                self.clear_mute();
                self.max_severity = Severity::None;
                self.cancel(AlarmTimer::AutoAcknowledge);
                self.cancel_escalation();
            } else if self.max_severity.is_none() {
                self.cancel(AlarmTimer::AutoAcknowledge);
            } else if !self.settings.auto_acknowledge_delay.is_zero()
                && !self.is_armed(AlarmTimer::AutoAcknowledge)
            {
                self.arm(AlarmTimer::AutoAcknowledge, self.settings.auto_acknowledge_delay);
            }
            return true;
        }

        self.cancel(AlarmTimer::AutoAcknowledge);
        self.max_severity = self.max_severity.max(severity);
        if self.acknowledged && severity > self.ack_severity {
            info!(alarm = %self.name, %severity, "severity rose above acknowledged level");
            self.unacknowledge();
        }
        if old_max < Severity::Critical && self.max_severity >= Severity::Critical {
            self.arm_escalation();
        }
        if self.is_muted() && severity > self.muted_severity {
            info!(alarm = %self.name, %severity, "severity rose above muted level, unmuting");
            self.clear_mute();
        }
        true
    }

    /// Acknowledge as `user`. Returns `false` if nothing changed.
    pub fn acknowledge(&mut self, user: &str) -> bool {
        self.cancel(AlarmTimer::AutoAcknowledge);
        self.cancel(AlarmTimer::AutoUnacknowledge);
        self.cancel_escalation();
        if self.is_nominal() {
            return false;
        }
        self.resolve_incident();

        if self.acknowledged {
            if self.severity > Severity::None && !self.settings.auto_unacknowledge_delay.is_zero() {
                self.arm(AlarmTimer::AutoUnacknowledge, self.settings.auto_unacknowledge_delay);
                return true;
            }
            return false;
        }
        if self.severity.is_none() {
            // Stale: nothing is wrong any more, go straight to nominal.
            self.max_severity = Severity::None;
            self.clear_mute();
            return true;
        }
        self.acknowledged = true;
        self.acknowledged_by = user.to_string();
        self.ack_severity = self.severity;
        if !self.settings.auto_unacknowledge_delay.is_zero() {
            self.arm(AlarmTimer::AutoUnacknowledge, self.settings.auto_unacknowledge_delay);
        }
        true
    }

    /// Returns `false` if the alarm was not acknowledged.
    pub fn unacknowledge(&mut self) -> bool {
        self.cancel(AlarmTimer::AutoUnacknowledge);
        if self.is_nominal() || !self.acknowledged {
            return false;
        }
        self.clear_acknowledgement();
        self.arm_escalation();
        true
    }

    /// Mute for `duration`. The alarm unmutes itself early if its severity
    /// rises above `threshold`, which defaults to the current severity
    /// (at least WARNING). A new mute replaces the previous one.
    pub fn mute(&mut self, duration: Duration, threshold: Option<Severity>, user: &str) -> Result<(), EngineError> {
        if duration.is_zero() {
            return Err(EngineError::InvalidMute("duration must be positive".into()));
        }
        let threshold = match threshold {
            Some(s) if s.is_none() => {
                return Err(EngineError::InvalidMute("severity must be above NONE".into()))
            }
            Some(s) => s,
            None => self.severity.max(Severity::Warning),
        };
        self.cancel(AlarmTimer::Unmute);
        self.muted_until = deadline(duration);
        self.muted_by = user.to_string();
        self.muted_severity = threshold;
        self.arm(AlarmTimer::Unmute, duration);
        Ok(())
    }

    /// Returns `false` if the alarm was not muted.
    pub fn unmute(&mut self) -> bool {
        let muted = self.is_muted();
        self.clear_mute();
        muted
    }

    /// Back to nominal with no timers, e.g. when the model is enabled.
    pub fn reset(&mut self) {
        self.resolve_incident();
        self.severity = Severity::None;
        self.max_severity = Severity::None;
        self.reason.clear();
        self.clear_acknowledgement();
        self.clear_mute();
        self.cancel_escalation();
        self.timers.clear();
    }

    /// Cancel every timer. Pending effects are dropped.
    pub fn shutdown(&mut self) {
        self.timers.clear();
        self.effects.clear();
        self.escalate_at = None;
    }

    /// Act on a timer firing. Stale wakes and wakes whose precondition no
    /// longer holds are no-ops. Returns `true` if the alarm changed.
    pub fn handle_wake(&mut self, wake: &AlarmWake) -> bool {
        let current = self
            .timers
            .get(&wake.timer)
            .is_some_and(|t| t.generation == wake.generation);
        if !current {
            debug!(alarm = %self.name, timer = ?wake.timer, "ignoring stale alarm timer");
            return false;
        }
        self.timers.remove(&wake.timer);

        match wake.timer {
            AlarmTimer::Escalate => self.escalate(),
            AlarmTimer::AutoAcknowledge => self.is_stale() && self.acknowledge(AUTOMATIC_USER),
            AlarmTimer::AutoUnacknowledge => self.acknowledged && self.unacknowledge(),
            AlarmTimer::Unmute => self.unmute(),
        }
    }

    /// Record the outcome of an incident create started by this alarm.
    ///
    /// A create that succeeds after the alarm was acknowledged or reset is
    /// resolved straight away.
    pub fn escalation_finished(&mut self, event_id: Uuid, result: Result<(), String>) {
        let current = self.pending_escalation == Some(event_id);
        if current {
            self.pending_escalation = None;
        }
        let wanted = current && !self.acknowledged && self.max_severity >= Severity::Critical;
        match result {
            Ok(()) if wanted => {
                info!(alarm = %self.name, %event_id, "alarm escalated");
                self.escalated_id = event_id.to_string();
            }
            Ok(()) => {
                info!(alarm = %self.name, %event_id, "escalation no longer wanted, resolving");
                self.effects.push(AlarmEffect::Resolve(event_id.to_string()));
            }
            Err(reason) if wanted => {
                warn!(alarm = %self.name, %reason, "escalation failed");
                self.escalated_id = format!("{FAILED_PREFIX}{reason}");
            }
            Err(reason) => {
                debug!(alarm = %self.name, %reason, "stale escalation failed");
            }
        }
    }

    /// Drain queued outbound work.
    pub fn take_effects(&mut self) -> Vec<AlarmEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Current state if it differs from the last one published.
    pub fn take_publication(&mut self) -> Option<AlarmEvent> {
        let snapshot = self.snapshot();
        if self.published.as_ref() == Some(&snapshot) {
            return None;
        }
        self.published = Some(snapshot.clone());
        Some(snapshot)
    }

    /// Current state, whether or not it changed.
    pub fn force_publication(&mut self) -> AlarmEvent {
        let snapshot = self.snapshot();
        self.published = Some(snapshot.clone());
        snapshot
    }

    // ── Internals ───────────────────────────────────────────────────

    fn arm(&mut self, timer: AlarmTimer, delay: Duration) {
        let armed = self.hub.arm(&self.name, timer, delay);
        self.timers.insert(timer, armed);
    }

    fn cancel(&mut self, timer: AlarmTimer) {
        self.timers.remove(&timer);
    }

    fn arm_escalation(&mut self) {
        let policy = &self.settings.escalation;
        if !policy.is_active()
            || self.acknowledged
            || self.max_severity < Severity::Critical
            || self.is_armed(AlarmTimer::Escalate)
            || self.pending_escalation.is_some()
            || !self.escalated_id.is_empty()
        {
            return;
        }
        let delay = policy.delay;
        self.escalate_at = deadline(delay);
        self.arm(AlarmTimer::Escalate, delay);
        debug!(alarm = %self.name, ?delay, "escalation armed");
    }

    fn cancel_escalation(&mut self) {
        self.cancel(AlarmTimer::Escalate);
        self.escalate_at = None;
    }

    fn escalate(&mut self) -> bool {
        self.escalate_at = None;
        let policy = &self.settings.escalation;
        if !policy.is_active()
            || self.acknowledged
            || self.max_severity < Severity::Critical
            || self.pending_escalation.is_some()
            || !self.escalated_id.is_empty()
        {
            return true;
        }
        let incident = Incident::new(self.name.clone(), policy.responder.clone(), self.reason.clone());
        self.pending_escalation = Some(incident.event_id);
        self.effects.push(AlarmEffect::Escalate(incident));
        true
    }

    /// Resolve an open incident (best effort) and forget it.
    fn resolve_incident(&mut self) {
        if !self.escalated_id.is_empty() && !self.escalated_id.starts_with(FAILED_PREFIX) {
            self.effects
                .push(AlarmEffect::Resolve(std::mem::take(&mut self.escalated_id)));
        }
        self.escalated_id.clear();
        self.pending_escalation = None;
    }

    fn clear_acknowledgement(&mut self) {
        self.cancel(AlarmTimer::AutoUnacknowledge);
        self.acknowledged = false;
        self.acknowledged_by.clear();
        self.ack_severity = Severity::None;
    }

    fn clear_mute(&mut self) {
        self.cancel(AlarmTimer::Unmute);
        self.muted_until = None;
        self.muted_by.clear();
        self.muted_severity = Severity::None;
    }
}
