//! Rule-owned timers.
//!
//! A timer never calls into its rule directly. When it fires it sends a
//! [`RuleWake`] to the engine, which evaluates the rule with
//! [`Trigger::Timer`](crate::Trigger::Timer) on its own loop. Every restart
//! takes a fresh generation, so a wake that was already queued when the
//! timer was restarted or cancelled is recognised as stale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A rule timer firing, delivered to the engine loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleWake {
    pub rule: String,
    pub timer: &'static str,
    pub generation: u64,
}

/// Handed to [`Rule::start`](crate::Rule::start) to create timers.
#[derive(Debug, Clone)]
pub struct RuleContext {
    rule: String,
    wakes: mpsc::UnboundedSender<RuleWake>,
    generations: Arc<AtomicU64>,
}

impl RuleContext {
    pub fn new(
        rule: impl Into<String>,
        wakes: mpsc::UnboundedSender<RuleWake>,
        generations: Arc<AtomicU64>,
    ) -> Self {
        Self {
            rule: rule.into(),
            wakes,
            generations,
        }
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// A new, idle timer.
    pub fn timer(&self, label: &'static str) -> RuleTimer {
        RuleTimer {
            ctx: self.clone(),
            label,
            generation: 0,
            handle: None,
        }
    }
}

/// Cancellable one-shot timer owned by a rule. Dropping it cancels it.
#[derive(Debug)]
pub struct RuleTimer {
    ctx: RuleContext,
    label: &'static str,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl RuleTimer {
    /// Cancel any pending firing and fire once after `delay`.
    pub fn restart(&mut self, delay: Duration) {
        self.abort();
        self.generation = self.ctx.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let wake = RuleWake {
            rule: self.ctx.rule.clone(),
            timer: self.label,
            generation: self.generation,
        };
        let wakes = self.ctx.wakes.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The engine may already be gone at shutdown.
            let _ = wakes.send(wake);
        }));
    }

    pub fn cancel(&mut self) {
        self.abort();
        self.generation = 0;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Consume a wake addressed to this timer.
    ///
    /// Returns `true` if it is the firing of the current arming; the timer
    /// is then idle. Stale wakes return `false` and change nothing.
    pub fn fire(&mut self, wake: &RuleWake) -> bool {
        let current = self.handle.is_some()
            && wake.timer == self.label
            && wake.generation == self.generation
            && wake.rule == self.ctx.rule;
        if current {
            self.handle = None;
        } else {
            debug!(rule = %wake.rule, timer = wake.timer, "ignoring stale timer wake");
        }
        current
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for RuleTimer {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (RuleContext, mpsc::UnboundedReceiver<RuleWake>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RuleContext::new("Heartbeat.ATDome:0", tx, Arc::default()), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (ctx, mut rx) = context();
        let mut timer = ctx.timer("heartbeat");
        timer.restart(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(rx.try_recv().is_err());

        let wake = rx.recv().await.unwrap();
        assert!(timer.fire(&wake));
        assert!(!timer.is_running());
        assert!(!timer.fire(&wake));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_makes_queued_wake_stale() {
        let (ctx, mut rx) = context();
        let mut timer = ctx.timer("heartbeat");
        timer.restart(Duration::from_secs(1));
        let stale = rx.recv().await.unwrap();

        timer.restart(Duration::from_secs(1));
        assert!(!timer.fire(&stale));

        let fresh = rx.recv().await.unwrap();
        assert!(timer.fire(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let (ctx, mut rx) = context();
        let mut timer = ctx.timer("heartbeat");
        timer.restart(Duration::from_secs(1));
        drop(timer);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }
}
