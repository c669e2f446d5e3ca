//! The model: resource broker and rule driver.
//!
//! A [`Model`] is built from a validated [`WatcherConfig`]: it constructs
//! every rule through the [`RuleRegistry`], skips rules that need a disabled
//! source, registers each rule's declared topics with the shared
//! [`TopicDispatcher`] and runs every rule's `setup` before any data flows.
//!
//! Once spawned, a single task owns the rules, their alarms and the
//! dispatcher. Samples, poll ticks, rule timers, alarm timers, escalation
//! results and operator commands all arrive as messages on that task, so
//! each alarm sees one transition at a time. Incident calls run as separate
//! tasks and report back; the loop never waits on them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vigil_core::{Severity, WatcherConfig};
use vigil_eisenbahn::{
    DeliveryMode, RuleId, Sample, SampleFeed, SampleSource, SourceKey, TopicDispatcher, TopicKey,
};
use vigil_notify::{EscalationTable, Escalator, NotifyError};
use vigil_rules::{Evaluation, Rule, RuleContext, RuleRegistry, RuleWake, Trigger};

use crate::alarm::{Alarm, AlarmEffect, AlarmEvent, AlarmSettings, AlarmWake, TimerHub};
use crate::error::EngineError;

const COMMAND_BUFFER: usize = 64;

// ── Commands ────────────────────────────────────────────────────────

/// Which alarms a control operation applies to.
#[derive(Debug, Clone)]
enum Target {
    Name(String),
    /// Full-match regular expression over alarm names.
    Matching(Regex),
}

#[derive(Debug, Clone)]
enum Action {
    Acknowledge { user: String },
    Unacknowledge,
    Mute {
        duration: Duration,
        severity: Option<Severity>,
        user: String,
    },
    Unmute,
}

enum Command {
    Enable(oneshot::Sender<()>),
    Disable(oneshot::Sender<()>),
    Control {
        target: Target,
        action: Action,
        reply: oneshot::Sender<Result<Vec<String>, EngineError>>,
    },
    List(oneshot::Sender<Vec<AlarmEvent>>),
    Get {
        name: String,
        reply: oneshot::Sender<Option<AlarmEvent>>,
    },
    Stats(oneshot::Sender<ModelStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Outcome of an incident create, sent back to the model task.
#[derive(Debug)]
struct EscalationResult {
    alarm: String,
    event_id: Uuid,
    outcome: Result<(), String>,
}

/// Counts of what the model brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStats {
    pub rules: usize,
    pub connections: usize,
    pub subscriptions: usize,
    pub filters: usize,
    pub enabled: bool,
}

// ── Model ───────────────────────────────────────────────────────────

struct RuleSlot {
    rule: Box<dyn Rule>,
    alarm: Alarm,
    /// Topics the rule declared; its views are restricted to these.
    allowed: HashSet<TopicKey>,
    /// Shortest poll interval among its poll-mode sources.
    poll: Option<Duration>,
}

/// Receivers drained by the model task.
struct Inbox {
    samples: mpsc::UnboundedReceiver<Sample>,
    alarm_wakes: mpsc::UnboundedReceiver<AlarmWake>,
    rule_wakes: mpsc::UnboundedReceiver<RuleWake>,
    polls: mpsc::UnboundedReceiver<RuleId>,
    escalations: mpsc::UnboundedReceiver<EscalationResult>,
}

pub struct Model {
    slots: Vec<RuleSlot>,
    index: HashMap<String, RuleId>,
    dispatcher: TopicDispatcher,
    enabled: bool,

    escalator: Arc<dyn Escalator>,
    escalation_timeout: Duration,
    events: mpsc::UnboundedSender<AlarmEvent>,

    feed: SampleFeed,
    rule_wakes: mpsc::UnboundedSender<RuleWake>,
    rule_generations: Arc<AtomicU64>,
    polls: mpsc::UnboundedSender<RuleId>,
    escalations: mpsc::UnboundedSender<EscalationResult>,
    inbox: Option<Inbox>,

    pollers: Vec<JoinHandle<()>>,
    source: Option<Arc<dyn SampleSource>>,
}

impl Model {
    /// Build rules and alarms from `config` and wire up their sources.
    ///
    /// Every alarm state change is sent on `events`.
    #[instrument(skip_all, fields(rule_sets = config.rules.len()))]
    pub fn new(
        config: &WatcherConfig,
        registry: &RuleRegistry,
        escalator: Arc<dyn Escalator>,
        events: mpsc::UnboundedSender<AlarmEvent>,
    ) -> Result<Self, EngineError> {
        let disabled = config
            .disabled_sources
            .iter()
            .map(|name| SourceKey::parse(name))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| EngineError::Configuration(format!("disabled_sources: {e}")))?;
        let table = EscalationTable::new(&config.escalation)
            .map_err(|e| EngineError::Configuration(format!("escalation: {e}")))?;
        let delays = |e: vigil_core::CoreError| EngineError::Configuration(e.to_string());
        let auto_acknowledge_delay = config.auto_acknowledge_delay().map_err(delays)?;
        let auto_unacknowledge_delay = config.auto_unacknowledge_delay().map_err(delays)?;
        let escalation_timeout = config.escalation_timeout().map_err(delays)?;

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (alarm_wakes_tx, alarm_wakes_rx) = mpsc::unbounded_channel();
        let (rule_wakes_tx, rule_wakes_rx) = mpsc::unbounded_channel();
        let (polls_tx, polls_rx) = mpsc::unbounded_channel();
        let (escalations_tx, escalations_rx) = mpsc::unbounded_channel();
        let hub = TimerHub::new(alarm_wakes_tx);

        let mut slots: Vec<RuleSlot> = Vec::new();
        let mut index = HashMap::new();
        let mut dispatcher = TopicDispatcher::new();

        for rule_set in &config.rules {
            for (i, rule_config) in rule_set.configs.iter().enumerate() {
                let rule = registry.build(&rule_set.classname, rule_config).map_err(|e| {
                    EngineError::Configuration(format!("{}[{i}]: {e}", rule_set.classname))
                })?;
                let name = rule.name().to_string();
                if !rule.is_usable(&disabled) {
                    warn!(rule = %name, "skipping rule: it needs a disabled data source");
                    continue;
                }
                if index.contains_key(&name) {
                    return Err(EngineError::DuplicateAlarm(name));
                }

                let id = slots.len();
                let allowed = dispatcher.register(id, rule.sources());
                let poll = rule
                    .sources()
                    .iter()
                    .filter_map(|d| match d.mode {
                        DeliveryMode::Poll { interval } => Some(interval),
                        DeliveryMode::Callback => None,
                    })
                    .min();
                if poll.is_some_and(|period| period.is_zero()) {
                    return Err(EngineError::Configuration(format!("{name}: poll interval must be positive")));
                }
                let settings = AlarmSettings {
                    auto_acknowledge_delay,
                    auto_unacknowledge_delay,
                    escalation: table.policy_for(&name),
                };
                debug!(rule = %name, topics = allowed.len(), ?poll, "rule registered");
                index.insert(name.clone(), id);
                slots.push(RuleSlot {
                    alarm: Alarm::new(name, settings, hub.clone()),
                    rule,
                    allowed,
                    poll,
                });
            }
        }

        // Every connection and subscription exists now; filters go in
        // before the first sample.
        for slot in &mut slots {
            let mut setup = dispatcher.setup_view(&slot.allowed);
            slot.rule.setup(&mut setup).map_err(|e| {
                EngineError::Configuration(format!("{} setup: {e}", slot.rule.name()))
            })?;
        }

        info!(
            rules = slots.len(),
            connections = dispatcher.connection_count(),
            subscriptions = dispatcher.subscription_count(),
            filters = dispatcher.filter_count(),
            "model configured"
        );

        Ok(Self {
            slots,
            index,
            dispatcher,
            enabled: false,
            escalator,
            escalation_timeout,
            events,
            feed: samples_tx,
            rule_wakes: rule_wakes_tx,
            rule_generations: Arc::default(),
            polls: polls_tx,
            escalations: escalations_tx,
            inbox: Some(Inbox {
                samples: samples_rx,
                alarm_wakes: alarm_wakes_rx,
                rule_wakes: rule_wakes_rx,
                polls: polls_rx,
                escalations: escalations_rx,
            }),
            pollers: Vec::new(),
            source: None,
        })
    }

    pub fn alarm_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.alarm.name())
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            rules: self.slots.len(),
            connections: self.dispatcher.connection_count(),
            subscriptions: self.dispatcher.subscription_count(),
            filters: self.dispatcher.filter_count(),
            enabled: self.enabled,
        }
    }

    /// Open one connection per distinct source on `source`, then spawn.
    pub async fn start(
        mut self,
        source: Arc<dyn SampleSource>,
    ) -> Result<(ModelHandle, JoinHandle<()>), EngineError> {
        let connections: Vec<(SourceKey, Vec<String>)> = self
            .dispatcher
            .connections()
            .map(|(key, topics)| (key.clone(), topics))
            .collect();
        for (key, topics) in &connections {
            source.open(key, topics, self.feed.clone()).await?;
        }
        info!(connections = connections.len(), "data source connections open");
        self.source = Some(source);
        Ok(self.spawn())
    }

    /// Run the model on its own task. Samples go in through
    /// [`ModelHandle::feed`].
    pub fn spawn(self) -> (ModelHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = ModelHandle {
            commands: commands_tx,
            samples: self.feed.clone(),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let Some(mut inbox) = self.inbox.take() else {
            return;
        };
        info!(rules = self.slots.len(), "model running");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(sample) = inbox.samples.recv() => self.on_sample(sample),
                Some(wake) = inbox.alarm_wakes.recv() => self.on_alarm_wake(wake),
                Some(wake) = inbox.rule_wakes.recv() => self.on_rule_wake(wake),
                Some(id) = inbox.polls.recv() => {
                    if self.enabled {
                        self.evaluate(id, Trigger::Poll);
                    }
                }
                Some(result) = inbox.escalations.recv() => self.on_escalation_result(result),
            }
        }
        info!("model stopped");
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    fn enable(&mut self) {
        if self.enabled {
            return;
        }
        self.enabled = true;

        for id in 0..self.slots.len() {
            self.slots[id].alarm.reset();
            self.run_effects(id);
        }
        for slot in &mut self.slots {
            let ctx = RuleContext::new(
                slot.rule.name().to_string(),
                self.rule_wakes.clone(),
                self.rule_generations.clone(),
            );
            slot.rule.start(&ctx);
        }
        // One full-state event per alarm.
        for slot in &mut self.slots {
            let event = slot.alarm.force_publication();
            let _ = self.events.send(event);
        }
        self.start_pollers();

        for (sample, rules) in self.dispatcher.replay() {
            for id in rules {
                self.evaluate(id, Trigger::Sample(&sample));
            }
        }
        info!(alarms = self.slots.len(), "model enabled");
    }

    fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        self.stop_rules();
        info!("model disabled");
    }

    async fn shutdown(&mut self) {
        self.enabled = false;
        self.stop_rules();
        for slot in &mut self.slots {
            slot.alarm.shutdown();
        }
        if let Some(source) = self.source.take() {
            source.close().await;
        }
        info!("model shut down");
    }

    fn start_pollers(&mut self) {
        for (id, slot) in self.slots.iter().enumerate() {
            let Some(period) = slot.poll else {
                continue;
            };
            let polls = self.polls.clone();
            self.pollers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if polls.send(id).is_err() {
                        break;
                    }
                }
            }));
        }
    }

    fn stop_rules(&mut self) {
        for poller in self.pollers.drain(..) {
            poller.abort();
        }
        for slot in &mut self.slots {
            slot.rule.stop();
        }
    }

    // ── Inbound events ──────────────────────────────────────────────

    fn on_sample(&mut self, sample: Sample) {
        let rules = self.dispatcher.ingest(sample.clone());
        if !self.enabled {
            return;
        }
        for id in rules {
            self.evaluate(id, Trigger::Sample(&sample));
        }
    }

    fn on_rule_wake(&mut self, wake: RuleWake) {
        if !self.enabled {
            return;
        }
        match self.index.get(&wake.rule) {
            Some(&id) => self.evaluate(id, Trigger::Timer(&wake)),
            None => debug!(rule = %wake.rule, "timer wake for unknown rule"),
        }
    }

    fn on_alarm_wake(&mut self, wake: AlarmWake) {
        let Some(&id) = self.index.get(&wake.alarm) else {
            return;
        };
        if self.slots[id].alarm.handle_wake(&wake) {
            debug!(alarm = %wake.alarm, timer = ?wake.timer, "alarm timer fired");
        }
        self.flush(id);
    }

    fn on_escalation_result(&mut self, result: EscalationResult) {
        let Some(&id) = self.index.get(&result.alarm) else {
            return;
        };
        self.slots[id]
            .alarm
            .escalation_finished(result.event_id, result.outcome);
        self.flush(id);
    }

    fn evaluate(&mut self, id: RuleId, trigger: Trigger<'_>) {
        let slot = &mut self.slots[id];
        let view = self.dispatcher.view(&slot.allowed);
        match slot.rule.evaluate(trigger, &view) {
            Ok(Evaluation::Unchanged) => {}
            Ok(Evaluation::Set { severity, reason }) => {
                slot.alarm.set_severity(severity, reason);
            }
            Err(e) => {
                warn!(rule = %slot.rule.name(), error = %e, "rule evaluation failed");
            }
        }
        self.flush(id);
    }

    // ── Commands ────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enable(reply) => {
                self.enable();
                let _ = reply.send(());
            }
            Command::Disable(reply) => {
                self.disable();
                let _ = reply.send(());
            }
            Command::Control {
                target,
                action,
                reply,
            } => {
                let _ = reply.send(self.control(&target, &action));
            }
            Command::List(reply) => {
                let _ = reply.send(self.slots.iter().map(|s| s.alarm.snapshot()).collect());
            }
            Command::Get { name, reply } => {
                let event = self.index.get(&name).map(|&id| self.slots[id].alarm.snapshot());
                let _ = reply.send(event);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            // Handled by the loop.
            Command::Shutdown(_) => {}
        }
    }

    /// Apply `action` to every targeted alarm; returns the alarms it changed.
    fn control(&mut self, target: &Target, action: &Action) -> Result<Vec<String>, EngineError> {
        let ids: Vec<RuleId> = match target {
            Target::Name(name) => vec![*self
                .index
                .get(name)
                .ok_or_else(|| EngineError::UnknownAlarm(name.clone()))?],
            Target::Matching(pattern) => self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| pattern.is_match(s.alarm.name()))
                .map(|(id, _)| id)
                .collect(),
        };

        let mut changed = Vec::new();
        for id in ids {
            let alarm = &mut self.slots[id].alarm;
            let did_change = match action {
                Action::Acknowledge { user } => alarm.acknowledge(user),
                Action::Unacknowledge => alarm.unacknowledge(),
                Action::Mute {
                    duration,
                    severity,
                    user,
                } => {
                    alarm.mute(*duration, *severity, user)?;
                    true
                }
                Action::Unmute => alarm.unmute(),
            };
            if did_change {
                info!(alarm = %alarm.name(), ?action, "alarm updated by command");
                changed.push(alarm.name().to_string());
            }
            self.flush(id);
        }
        Ok(changed)
    }

    // ── Effects and publication ─────────────────────────────────────

    fn flush(&mut self, id: RuleId) {
        self.run_effects(id);
        if let Some(event) = self.slots[id].alarm.take_publication() {
            let _ = self.events.send(event);
        }
    }

    fn run_effects(&mut self, id: RuleId) {
        for effect in self.slots[id].alarm.take_effects() {
            match effect {
                AlarmEffect::Escalate(incident) => {
                    let escalator = self.escalator.clone();
                    let results = self.escalations.clone();
                    let timeout = self.escalation_timeout;
                    tokio::spawn(async move {
                        let outcome = match tokio::time::timeout(timeout, escalator.create(&incident)).await {
                            Ok(result) => result,
                            Err(_) => Err(NotifyError::Timeout),
                        }
                        .map_err(|e| e.to_string());
                        if let Err(reason) = &outcome {
                            warn!(
                                alarm = %incident.alarm_name,
                                channel = escalator.channel_name(),
                                %reason,
                                "failed to escalate alarm"
                            );
                        }
                        let _ = results.send(EscalationResult {
                            alarm: incident.alarm_name,
                            event_id: incident.event_id,
                            outcome,
                        });
                    });
                }
                AlarmEffect::Resolve(event_id) => {
                    let escalator = self.escalator.clone();
                    let timeout = self.escalation_timeout;
                    tokio::spawn(async move {
                        let result = match tokio::time::timeout(timeout, escalator.resolve(&event_id)).await {
                            Ok(result) => result,
                            Err(_) => Err(NotifyError::Timeout),
                        };
                        if let Err(e) = result {
                            warn!(%event_id, error = %e, "failed to resolve incident");
                        }
                    });
                }
            }
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Control surface of a running [`Model`]. Cheap to clone.
///
/// Every call fails with [`EngineError::Closed`] once the model task is gone.
#[derive(Clone)]
pub struct ModelHandle {
    commands: mpsc::Sender<Command>,
    samples: SampleFeed,
}

impl ModelHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    async fn control(&self, target: Target, action: Action) -> Result<Vec<String>, EngineError> {
        self.request(|reply| Command::Control {
            target,
            action,
            reply,
        })
        .await?
    }

    async fn control_one(&self, name: &str, action: Action) -> Result<bool, EngineError> {
        let changed = self.control(Target::Name(name.to_string()), action).await?;
        Ok(!changed.is_empty())
    }

    async fn control_matching(&self, pattern: &str, action: Action) -> Result<Vec<String>, EngineError> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;
        self.control(Target::Matching(regex), action).await
    }

    /// Samples sent here are handled as if a data source delivered them.
    pub fn feed(&self) -> SampleFeed {
        self.samples.clone()
    }

    /// Reset every alarm, start every rule and publish the full state.
    pub async fn enable(&self) -> Result<(), EngineError> {
        self.request(Command::Enable).await
    }

    /// Stop rules; samples still update the latest values.
    pub async fn disable(&self) -> Result<(), EngineError> {
        self.request(Command::Disable).await
    }

    pub async fn acknowledge(&self, name: &str, user: &str) -> Result<bool, EngineError> {
        self.control_one(name, Action::Acknowledge { user: user.to_string() })
            .await
    }

    pub async fn acknowledge_matching(&self, pattern: &str, user: &str) -> Result<Vec<String>, EngineError> {
        self.control_matching(pattern, Action::Acknowledge { user: user.to_string() })
            .await
    }

    pub async fn unacknowledge(&self, name: &str) -> Result<bool, EngineError> {
        self.control_one(name, Action::Unacknowledge).await
    }

    pub async fn unacknowledge_matching(&self, pattern: &str) -> Result<Vec<String>, EngineError> {
        self.control_matching(pattern, Action::Unacknowledge).await
    }

    /// Mute for `duration`. See [`Alarm::mute`] for `severity`.
    pub async fn mute(
        &self,
        name: &str,
        duration: Duration,
        severity: Option<Severity>,
        user: &str,
    ) -> Result<bool, EngineError> {
        let action = Action::Mute {
            duration,
            severity,
            user: user.to_string(),
        };
        self.control_one(name, action).await
    }

    pub async fn mute_matching(
        &self,
        pattern: &str,
        duration: Duration,
        severity: Option<Severity>,
        user: &str,
    ) -> Result<Vec<String>, EngineError> {
        let action = Action::Mute {
            duration,
            severity,
            user: user.to_string(),
        };
        self.control_matching(pattern, action).await
    }

    pub async fn unmute(&self, name: &str) -> Result<bool, EngineError> {
        self.control_one(name, Action::Unmute).await
    }

    pub async fn unmute_matching(&self, pattern: &str) -> Result<Vec<String>, EngineError> {
        self.control_matching(pattern, Action::Unmute).await
    }

    /// Snapshot of every alarm, in configuration order.
    pub async fn alarms(&self) -> Result<Vec<AlarmEvent>, EngineError> {
        self.request(Command::List).await
    }

    pub async fn alarm(&self, name: &str) -> Result<Option<AlarmEvent>, EngineError> {
        self.request(|reply| Command::Get {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> Result<ModelStats, EngineError> {
        self.request(Command::Stats).await
    }

    /// Stop rules, cancel every alarm timer and close the data source.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(Command::Shutdown).await
    }
}
