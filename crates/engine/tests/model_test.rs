//! End-to-end tests of the model task: rules, shared topics, alarm timers
//! and escalation, all driven through a [`ModelHandle`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vigil_core::{Severity, WatcherConfig};
use vigil_eisenbahn::{Sample, SourceDescriptor, SourceKey, SourceView};
use vigil_engine::{AlarmEvent, Model, ModelHandle};
use vigil_notify::{Escalator, Incident, NotifyError};
use vigil_rules::{parse_config, Evaluation, Rule, RuleError, RuleRegistry, Trigger};

// ── Helpers ─────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingEscalator {
    creates: Mutex<Vec<Incident>>,
    resolves: Mutex<Vec<String>>,
    create_delay: Option<Duration>,
}

impl RecordingEscalator {
    fn creates(&self) -> Vec<Incident> {
        self.creates.lock().unwrap().clone()
    }

    fn resolves(&self) -> Vec<String> {
        self.resolves.lock().unwrap().clone()
    }
}

#[async_trait]
impl Escalator for RecordingEscalator {
    async fn create(&self, incident: &Incident) -> Result<(), NotifyError> {
        self.creates.lock().unwrap().push(incident.clone());
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn resolve(&self, event_id: &str) -> Result<(), NotifyError> {
        self.resolves.lock().unwrap().push(event_id.to_string());
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "recording"
    }
}

/// Sets WARNING with every `v` it has seen so far as the reason.
struct Recorder {
    name: String,
    sources: Vec<SourceDescriptor>,
    seen: Vec<i64>,
}

#[derive(Deserialize)]
struct RecorderConfig {
    name: String,
    topic: String,
}

fn recorder(value: &serde_yaml::Value) -> Result<Box<dyn Rule>, RuleError> {
    let config: RecorderConfig = parse_config("test.Recorder", value)?;
    Ok(Box::new(Recorder {
        name: format!("test.Recorder.{}", config.name),
        sources: vec![SourceDescriptor::callback(&SourceKey::new("ESS", 1), config.topic)],
        seen: Vec::new(),
    }))
}

impl Rule for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    fn evaluate(&mut self, trigger: Trigger<'_>, view: &SourceView<'_>) -> Result<Evaluation, RuleError> {
        let Trigger::Sample(sample) = trigger else {
            return Ok(Evaluation::Unchanged);
        };
        // Topics declared by other rules on the same connection stay hidden.
        let humidity = SourceKey::new("ESS", 1).topic("humidity");
        if sample.topic != humidity && view.latest(&humidity).is_ok() {
            return Err(RuleError::Evaluation("saw an undeclared topic".into()));
        }
        let v = sample
            .i64("v")
            .ok_or_else(|| RuleError::Evaluation("missing v".into()))?;
        self.seen.push(v);
        let reason = self
            .seen
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Ok(Evaluation::set(Severity::Warning, reason))
    }
}

struct Harness {
    handle: ModelHandle,
    events: mpsc::UnboundedReceiver<AlarmEvent>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(yaml: &str, escalator: Arc<dyn Escalator>) -> Self {
        let config = WatcherConfig::from_yaml(yaml).unwrap();
        let mut registry = RuleRegistry::default();
        registry.register("test.Recorder", recorder);
        let (tx, events) = mpsc::unbounded_channel();
        let model = Model::new(&config, &registry, escalator, tx).unwrap();
        let (handle, task) = model.spawn();
        Self { handle, events, task }
    }

    async fn enabled(yaml: &str, escalator: Arc<dyn Escalator>) -> Self {
        let mut harness = Self::start(yaml, escalator);
        harness.handle.enable().await.unwrap();
        harness.drain();
        harness
    }

    fn feed(&self, sample: Sample) {
        self.handle.feed().send(sample).unwrap();
    }

    async fn next_event(&mut self) -> AlarmEvent {
        tokio::time::timeout(Duration::from_secs(7200), self.events.recv())
            .await
            .expect("timed out waiting for an alarm event")
            .expect("model stopped")
    }

    /// Wait for an event on `name` matching `pred`.
    async fn wait_for(&mut self, name: &str, pred: impl Fn(&AlarmEvent) -> bool) -> AlarmEvent {
        loop {
            let event = self.next_event().await;
            if event.name == name && pred(&event) {
                return event;
            }
        }
    }

    fn drain(&mut self) -> Vec<AlarmEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Let spawned tasks and queued messages run.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn summary_state(component: &str, code: i64) -> Sample {
    Sample::new(
        SourceKey::parse(component).unwrap().topic("summaryState"),
        json!({ "summaryState": code }),
    )
}

const FAULT: i64 = 3;
const OFFLINE: i64 = 4;
const STANDBY: i64 = 5;
const ENABLED: i64 = 2;

const ENABLED_ATDOME: &str = "Enabled.ATDome:0";

// ── Rules and dispatch ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_then_heartbeat_goes_stale() {
    let yaml = r#"
rules:
  - classname: Heartbeat
    configs:
      - name: ATDome
        timeout: 5
"#;
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    let start = tokio::time::Instant::now();

    let event = harness.next_event().await;
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert_eq!(event.name, "Heartbeat.ATDome:0");
    assert_eq!(event.severity, Severity::Critical);
    assert!(event.reason.contains("timeout"), "{}", event.reason);

    harness.feed(Sample::new(SourceKey::new("ATDome", 0).topic("heartbeat"), json!({})));
    let event = harness.next_event().await;
    assert_eq!(event.severity, Severity::None);
    assert_eq!(event.max_severity, Severity::Critical);
    assert!(event.reason.is_empty());
    assert!(!event.acknowledged);
}

#[tokio::test(start_paused = true)]
async fn shared_topic_delivers_in_order_to_every_rule() {
    let yaml = r#"
rules:
  - classname: test.Recorder
    configs:
      - name: a
        topic: temperature
      - name: b
        topic: temperature
      - name: c
        topic: humidity
"#;
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    let stats = harness.handle.stats().await.unwrap();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.subscriptions, 2);

    let temperature = SourceKey::new("ESS", 1).topic("temperature");
    for v in 1..=3 {
        harness.feed(Sample::new(temperature.clone(), json!({ "v": v })));
    }
    harness.settle().await;

    let alarms = harness.handle.alarms().await.unwrap();
    let reason = |name: &str| {
        alarms
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.reason.clone())
            .unwrap()
    };
    assert_eq!(reason("test.Recorder.a"), "1,2,3");
    assert_eq!(reason("test.Recorder.b"), "1,2,3");
    assert_eq!(reason("test.Recorder.c"), "");
    assert_eq!(harness.drain().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn enable_publishes_every_alarm_once() {
    let yaml = r#"
rules:
  - classname: Heartbeat
    configs:
      - name: ATDome
  - classname: Enabled
    configs:
      - name: ATDome
      - name: ESS:1
  - classname: Telemetry
    configs:
      - name: ATDome
        callback_name: position
        summary_states: [ENABLED]
"#;
    let mut harness = Harness::start(yaml, Arc::new(RecordingEscalator::default()));
    harness.handle.enable().await.unwrap();

    let events = harness.drain();
    let names: HashSet<_> = events.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(events.len(), 4);
    assert_eq!(names.len(), 4);
    assert!(events.iter().all(AlarmEvent::is_nominal));

    // Already enabled: nothing more.
    harness.handle.enable().await.unwrap();
    assert!(harness.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unchanged_severity_publishes_once() {
    let yaml = "rules:\n  - classname: Enabled\n    configs:\n      - name: ATDome\n";
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;

    harness.feed(summary_state("ATDome", FAULT));
    harness.feed(summary_state("ATDome", FAULT));
    harness.settle().await;

    let events = harness.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::Critical);
    assert_eq!(events[0].reason, "FAULT state");
}

#[tokio::test(start_paused = true)]
async fn disabled_model_caches_samples_and_replays_them_on_enable() {
    let yaml = "rules:\n  - classname: Enabled\n    configs:\n      - name: ATDome\n";
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    harness.handle.disable().await.unwrap();

    harness.feed(summary_state("ATDome", FAULT));
    harness.settle().await;
    let alarm = harness.handle.alarm(ENABLED_ATDOME).await.unwrap().unwrap();
    assert!(alarm.is_nominal());
    assert!(harness.drain().is_empty());

    harness.handle.enable().await.unwrap();
    let events = harness.drain();
    assert_eq!(events.len(), 2);
    assert!(events[0].is_nominal());
    assert_eq!(events[1].severity, Severity::Critical);
}

#[tokio::test(start_paused = true)]
async fn threshold_polls_only_the_filtered_sensor() {
    let yaml = r#"
rules:
  - classname: Threshold
    configs:
      - name: ESS:1
        topic: temperature
        field: value
        filter_field: sensorName
        filter_value: dome
        poll_interval: 10
        warning_level: 20
        critical_level: 30
        units: C
"#;
    const DOME: &str = "Threshold.ESS:1.temperature.value.dome";
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    let start = tokio::time::Instant::now();

    let temperature = SourceKey::new("ESS", 1).topic("temperature");
    let reading = |sensor: &str, value: f64| {
        Sample::new(temperature.clone(), json!({ "sensorName": sensor, "value": value }))
    };
    harness.feed(reading("dome", 25.0));
    harness.feed(reading("floor", 40.0));
    harness.feed(reading("dome", 26.0));
    harness.feed(reading("floor", 45.0));
    harness.settle().await;

    // Samples alone never evaluate a polled rule.
    assert!(harness.drain().is_empty());
    let alarm = harness.handle.alarm(DOME).await.unwrap().unwrap();
    assert!(alarm.is_nominal());

    let event = harness.next_event().await;
    assert_eq!(start.elapsed(), Duration::from_secs(10));
    assert_eq!(event.name, DOME);
    assert_eq!(event.severity, Severity::Warning);
    assert_eq!(event.reason, "value 26.00 C > 20.00 as reported by dome");

    // Another sensor going critical does not touch this alarm.
    harness.feed(reading("floor", 50.0));
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(harness.drain().is_empty());

    harness.feed(reading("dome", 31.0));
    let event = harness.wait_for(DOME, |e| e.severity == Severity::Critical).await;
    assert!(event.reason.contains("31.00"), "{}", event.reason);
    assert!(event.reason.ends_with("as reported by dome"), "{}", event.reason);
}

#[tokio::test(start_paused = true)]
async fn failed_evaluation_keeps_alarm_state() {
    let yaml = "rules:\n  - classname: test.Recorder\n    configs:\n      - name: a\n        topic: temperature\n";
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    let temperature = SourceKey::new("ESS", 1).topic("temperature");

    harness.feed(Sample::new(temperature.clone(), json!({ "v": 1 })));
    let event = harness.next_event().await;
    assert_eq!(event.severity, Severity::Warning);
    assert_eq!(event.reason, "1");

    harness.feed(Sample::new(temperature.clone(), json!({ "w": 2 })));
    harness.settle().await;
    assert!(harness.drain().is_empty());
    let alarm = harness.handle.alarm("test.Recorder.a").await.unwrap().unwrap();
    assert_eq!(alarm.severity, Severity::Warning);
    assert_eq!(alarm.reason, "1");

    // The rule keeps receiving samples.
    harness.feed(Sample::new(temperature, json!({ "v": 3 })));
    let event = harness.next_event().await;
    assert_eq!(event.reason, "1,3");
}

// ── Operator commands ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stale_alarm_auto_acknowledges() {
    let yaml = r#"
auto_acknowledge_delay: 30
rules:
  - classname: Enabled
    configs:
      - name: ATDome
"#;
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    harness.feed(summary_state("ATDome", OFFLINE));
    harness.feed(summary_state("ATDome", ENABLED));
    let stale = harness.wait_for(ENABLED_ATDOME, |e| e.severity.is_none()).await;
    assert_eq!(stale.max_severity, Severity::Serious);

    let start = tokio::time::Instant::now();
    let event = harness.next_event().await;
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert!(event.is_nominal());
    assert!(!event.acknowledged);
}

#[tokio::test(start_paused = true)]
async fn mute_lifts_when_severity_rises() {
    let yaml = r#"
rules:
  - classname: Enabled
    configs:
      - name: ATDome
        standby_severity: WARNING
"#;
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    harness.feed(summary_state("ATDome", STANDBY));
    harness.wait_for(ENABLED_ATDOME, |e| e.severity == Severity::Warning).await;

    let changed = harness
        .handle
        .mute(ENABLED_ATDOME, Duration::from_secs(3600), None, "bob")
        .await
        .unwrap();
    assert!(changed);
    let muted = harness.next_event().await;
    assert_eq!(muted.muted_severity, Severity::Warning);
    assert_eq!(muted.muted_by, "bob");

    harness.feed(summary_state("ATDome", OFFLINE));
    let event = harness.next_event().await;
    assert_eq!(event.severity, Severity::Serious);
    assert!(!event.is_muted());
    assert!(event.muted_until.is_none());
}

#[tokio::test(start_paused = true)]
async fn invalid_mute_is_rejected() {
    let yaml = "rules:\n  - classname: Enabled\n    configs:\n      - name: ATDome\n";
    let harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    let result = harness
        .handle
        .mute(ENABLED_ATDOME, Duration::ZERO, None, "bob")
        .await;
    assert!(matches!(result, Err(vigil_engine::EngineError::InvalidMute(_))));
}

#[tokio::test(start_paused = true)]
async fn acknowledge_matching_applies_to_every_match() {
    let yaml = r#"
rules:
  - classname: Enabled
    configs:
      - name: ATDome
      - name: ESS:1
      - name: MTMount
"#;
    let mut harness = Harness::enabled(yaml, Arc::new(RecordingEscalator::default())).await;
    harness.feed(summary_state("ATDome", OFFLINE));
    harness.feed(summary_state("ESS:1", OFFLINE));
    harness.feed(summary_state("MTMount", OFFLINE));
    harness.settle().await;
    harness.drain();

    let mut changed = harness
        .handle
        .acknowledge_matching(r"Enabled\.(ATDome|ESS):\d", "alice")
        .await
        .unwrap();
    changed.sort();
    assert_eq!(changed, vec!["Enabled.ATDome:0", "Enabled.ESS:1"]);

    let alarms = harness.handle.alarms().await.unwrap();
    for alarm in alarms {
        let expected = alarm.name != "Enabled.MTMount:0";
        assert_eq!(alarm.acknowledged, expected, "{}", alarm.name);
        if expected {
            assert_eq!(alarm.acknowledged_by, "alice");
        }
    }
}

// ── Escalation ──────────────────────────────────────────────────────

const ESCALATING: &str = r#"
escalation_timeout: 1
rules:
  - classname: Enabled
    configs:
      - name: ATDome
escalation:
  - alarms: ["enabled.*"]
    to: ops
    delay: 10
"#;

#[tokio::test(start_paused = true)]
async fn critical_alarm_escalates_once_and_acknowledge_resolves() {
    let escalator = Arc::new(RecordingEscalator::default());
    let mut harness = Harness::enabled(ESCALATING, escalator.clone()).await;

    harness.feed(summary_state("ATDome", FAULT));
    let armed = harness.next_event().await;
    assert_eq!(armed.severity, Severity::Critical);
    assert!(armed.escalate_at.is_some());

    harness.feed(summary_state("ATDome", OFFLINE));
    let escalated = harness
        .wait_for(ENABLED_ATDOME, |e| !e.escalated_id.is_empty())
        .await;
    assert_eq!(escalated.max_severity, Severity::Critical);
    assert!(escalated.escalate_at.is_none());

    let creates = escalator.creates();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].alarm_name, ENABLED_ATDOME);
    assert_eq!(creates[0].responder, "ops");
    assert_eq!(creates[0].reason, "OFFLINE state");
    assert_eq!(escalated.escalated_id, creates[0].event_id.to_string());

    // A second critical spell in the same episode does not escalate again.
    harness.feed(summary_state("ATDome", FAULT));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(escalator.creates().len(), 1);

    assert!(harness.handle.acknowledge(ENABLED_ATDOME, "alice").await.unwrap());
    harness.settle().await;
    assert_eq!(escalator.resolves(), vec![creates[0].event_id.to_string()]);
    let alarm = harness.handle.alarm(ENABLED_ATDOME).await.unwrap().unwrap();
    assert!(alarm.acknowledged);
    assert!(alarm.escalated_id.is_empty());
}

#[tokio::test(start_paused = true)]
async fn acknowledge_before_delay_cancels_escalation() {
    let escalator = Arc::new(RecordingEscalator::default());
    let harness = Harness::enabled(ESCALATING, escalator.clone()).await;

    harness.feed(summary_state("ATDome", FAULT));
    harness.settle().await;
    assert!(harness.handle.acknowledge(ENABLED_ATDOME, "alice").await.unwrap());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(escalator.creates().is_empty());
    assert!(escalator.resolves().is_empty());
    let alarm = harness.handle.alarm(ENABLED_ATDOME).await.unwrap().unwrap();
    assert!(alarm.escalate_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_escalation_service_is_recorded_as_failure() {
    let escalator = Arc::new(RecordingEscalator {
        create_delay: Some(Duration::from_secs(60)),
        ..RecordingEscalator::default()
    });
    let mut harness = Harness::enabled(ESCALATING, escalator.clone()).await;

    harness.feed(summary_state("ATDome", FAULT));
    let event = harness
        .wait_for(ENABLED_ATDOME, |e| !e.escalated_id.is_empty())
        .await;
    assert_eq!(
        event.escalated_id,
        "Failed: timed out waiting for escalation service"
    );
    assert_eq!(escalator.creates().len(), 1);

    // Failure markers are never resolved.
    harness.handle.acknowledge(ENABLED_ATDOME, "alice").await.unwrap();
    harness.settle().await;
    assert!(escalator.resolves().is_empty());
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_timer() {
    let yaml = r#"
rules:
  - classname: Heartbeat
    configs:
      - name: ATDome
        timeout: 5
  - classname: Enabled
    configs:
      - name: ATDome
escalation:
  - alarms: ["Enabled.*"]
    to: ops
    delay: 10
"#;
    let escalator = Arc::new(RecordingEscalator::default());
    let mut harness = Harness::enabled(yaml, escalator.clone()).await;
    harness.feed(summary_state("ATDome", FAULT));
    harness.feed(summary_state("ATDome", FAULT));
    harness.settle().await;
    harness.drain();

    harness.handle.shutdown().await.unwrap();
    harness.task.await.unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(escalator.creates().is_empty());
    // The model dropped its sender; no event was published after shutdown.
    assert!(harness.events.recv().await.is_none());
}
