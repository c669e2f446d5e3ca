//! vigil-worker: runs the alarm model against a ZeroMQ sample feed.
//!
//! Subscribes to samples:
//! - `vigil.sample.<component>:<index>/<topic>` for every topic a rule declares
//!
//! Publishes events:
//! - `vigil.alarm.<name>`: one [`AlarmEvent`] per alarm state change

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use vigil_core::WatcherConfig;
use vigil_eisenbahn::topics;
use vigil_eisenbahn::{EventPublisher, Message, Transport, ZmqPublisher, ZmqSampleSource};
use vigil_engine::{AlarmEvent, Model};
use vigil_notify::{DisabledEscalator, Escalator, WebhookEscalator};
use vigil_rules::RuleRegistry;

// ── CLI ─────────────────────────────────────────────────────────────

/// Vigil alarm worker: evaluates rules and escalates unacknowledged alarms.
#[derive(Parser, Debug)]
#[command(name = "vigil-worker", version, about)]
struct Cli {
    /// Path to the watcher YAML config file.
    #[arg(long, env = "VIGIL_CONFIG", default_value = "config/watcher.yaml")]
    config: String,

    /// Endpoint publishing samples (`ipc://name` or `tcp://host:port`).
    #[arg(long, env = "VIGIL_SOURCE_ENDPOINT", default_value = "ipc://samples")]
    source_endpoint: String,

    /// Endpoint to bind for alarm events.
    #[arg(long, env = "VIGIL_PUBLISH_ENDPOINT", default_value = "ipc://alarms")]
    publish_endpoint: String,
}

fn transport(endpoint: &str) -> anyhow::Result<Transport> {
    Transport::parse(endpoint).with_context(|| format!("invalid endpoint {endpoint:?}"))
}

/// Forward alarm events to the publisher until the model drops its sender.
async fn publish_events(publisher: ZmqPublisher, mut events: mpsc::UnboundedReceiver<AlarmEvent>) {
    while let Some(event) = events.recv().await {
        let message = match Message::new(topics::alarm_topic(&event.name), &event) {
            Ok(m) => m,
            Err(e) => {
                warn!(alarm = %event.name, error = %e, "failed to encode alarm event");
                continue;
            }
        };
        if let Err(e) = publisher.publish(message).await {
            warn!(alarm = %event.name, error = %e, "failed to publish alarm event");
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vigil_core::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = WatcherConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config))?;
    info!(path = %cli.config, "loaded watcher config");
    config.log_summary();

    let escalator: Arc<dyn Escalator> = match WebhookEscalator::from_config(&config)? {
        Some(webhook) => Arc::new(webhook),
        None => {
            warn!("no escalation_url configured, escalations will be marked failed");
            Arc::new(DisabledEscalator)
        }
    };

    let publisher = ZmqPublisher::bind(&transport(&cli.publish_endpoint)?).await?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(publish_events(publisher, events_rx));

    let model = Model::new(&config, &RuleRegistry::default(), escalator, events_tx)?;
    let source = Arc::new(ZmqSampleSource::new(transport(&cli.source_endpoint)?));
    let (handle, task) = model.start(source).await?;
    handle.enable().await?;
    info!("vigil-worker running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    handle.shutdown().await?;
    task.await?;
    // The model owned the only event sender; the forwarder drains and exits.
    forwarder.await?;
    info!("vigil-worker exited cleanly");

    Ok(())
}
