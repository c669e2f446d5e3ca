//! Shared connections, subscriptions and per-rule isolated views.
//!
//! The [`TopicDispatcher`] is an arena of connections keyed by
//! [`SourceKey`] and subscriptions keyed by [`TopicKey`]. Each is created
//! once, the first time any rule declares it, and shared by every rule that
//! declares it afterwards. Rules never touch the arena directly: they get a
//! [`SourceView`] (read-only, latest value only) restricted to the topics
//! they declared, and a [`SetupView`] during setup to install field filters.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::error::EisenbahnError;
use crate::source::{DeliveryMode, Sample, SourceDescriptor, SourceKey, TopicKey};

/// Index of a rule inside the engine's rule table.
pub type RuleId = usize;

#[derive(Debug, Default)]
struct Connection {
    /// Number of rules using this connection.
    refs: usize,
    topics: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Subscription {
    latest: Option<Sample>,
    /// Rules evaluated on every sample, in registration order.
    callbacks: Vec<RuleId>,
    /// Filter field → field value → latest sample with that value.
    filters: BTreeMap<String, HashMap<String, Sample>>,
}

/// Fan-out of inbound samples to the rules that declared their topic.
#[derive(Debug, Default)]
pub struct TopicDispatcher {
    connections: BTreeMap<SourceKey, Connection>,
    subscriptions: BTreeMap<TopicKey, Subscription>,
}

impl TopicDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule's declared sources and return its topic allow-list.
    ///
    /// Connections and subscriptions are created the first time they are
    /// needed; later rules share them.
    pub fn register(&mut self, rule: RuleId, sources: &[SourceDescriptor]) -> HashSet<TopicKey> {
        let mut allowed = HashSet::with_capacity(sources.len());
        let mut counted: HashSet<&SourceKey> = HashSet::new();

        for descriptor in sources {
            let source = descriptor.source();
            let connection = self.connections.entry(source.clone()).or_default();
            if counted.insert(source) {
                connection.refs += 1;
            }
            connection.topics.insert(descriptor.topic.topic.clone());

            let subscription = self
                .subscriptions
                .entry(descriptor.topic.clone())
                .or_default();
            if descriptor.mode == DeliveryMode::Callback && !subscription.callbacks.contains(&rule) {
                subscription.callbacks.push(rule);
            }
            allowed.insert(descriptor.topic.clone());
        }
        allowed
    }

    /// Record a sample and return the rules to evaluate for it.
    ///
    /// Samples for topics no rule declared are dropped.
    pub fn ingest(&mut self, sample: Sample) -> Vec<RuleId> {
        let Some(subscription) = self.subscriptions.get_mut(&sample.topic) else {
            debug!(topic = %sample.topic, "dropping sample for unsubscribed topic");
            return Vec::new();
        };
        for (field, cache) in subscription.filters.iter_mut() {
            if let Some(value) = sample.field_key(field) {
                cache.insert(value, sample.clone());
            }
        }
        subscription.latest = Some(sample);
        subscription.callbacks.clone()
    }

    /// Install a filter cache on `field` for a topic. Idempotent: at most
    /// one cache exists per `(topic, field)`.
    fn install_filter(&mut self, topic: &TopicKey, field: &str) -> Result<(), EisenbahnError> {
        let subscription = self
            .subscriptions
            .get_mut(topic)
            .ok_or_else(|| EisenbahnError::Undeclared(topic.to_string()))?;
        if subscription.filters.contains_key(field) {
            return Ok(());
        }
        let mut cache = HashMap::new();
        if let Some(sample) = &subscription.latest {
            if let Some(value) = sample.field_key(field) {
                cache.insert(value, sample.clone());
            }
        }
        subscription.filters.insert(field.to_string(), cache);
        debug!(%topic, field, "installed topic filter");
        Ok(())
    }

    /// Latest sample of every callback topic, with the rules to evaluate.
    ///
    /// Used to bring rules up to date when the engine is enabled.
    pub fn replay(&self) -> Vec<(Sample, Vec<RuleId>)> {
        self.subscriptions
            .values()
            .filter(|s| !s.callbacks.is_empty())
            .filter_map(|s| s.latest.clone().map(|sample| (sample, s.callbacks.clone())))
            .collect()
    }

    /// Connections with the topics to subscribe on each.
    pub fn connections(&self) -> impl Iterator<Item = (&SourceKey, Vec<String>)> {
        self.connections
            .iter()
            .map(|(key, c)| (key, c.topics.iter().cloned().collect()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of rules sharing a connection (0 if it does not exist).
    pub fn connection_refs(&self, key: &SourceKey) -> usize {
        self.connections.get(key).map_or(0, |c| c.refs)
    }

    pub fn filter_count(&self) -> usize {
        self.subscriptions.values().map(|s| s.filters.len()).sum()
    }

    /// Isolated read view for one rule.
    pub fn view<'a>(&'a self, allowed: &'a HashSet<TopicKey>) -> SourceView<'a> {
        SourceView {
            allowed,
            dispatcher: self,
        }
    }

    /// Setup view for one rule, allowing filters on its declared topics.
    pub fn setup_view<'a>(&'a mut self, allowed: &'a HashSet<TopicKey>) -> SetupView<'a> {
        SetupView {
            allowed,
            dispatcher: self,
        }
    }
}

/// A rule's read-only window onto the topics it declared.
///
/// Only the most recent value is available; there is no way to wait for
/// the next one.
#[derive(Clone, Copy)]
pub struct SourceView<'a> {
    allowed: &'a HashSet<TopicKey>,
    dispatcher: &'a TopicDispatcher,
}

impl<'a> SourceView<'a> {
    fn check(&self, topic: &TopicKey) -> Result<&'a Subscription, EisenbahnError> {
        if !self.allowed.contains(topic) {
            return Err(EisenbahnError::Undeclared(topic.to_string()));
        }
        self.dispatcher
            .subscriptions
            .get(topic)
            .ok_or_else(|| EisenbahnError::Undeclared(topic.to_string()))
    }

    /// Most recent sample on a declared topic.
    pub fn latest(&self, topic: &TopicKey) -> Result<Option<&'a Sample>, EisenbahnError> {
        Ok(self.check(topic)?.latest.as_ref())
    }

    /// Most recent sample on a declared topic whose `field` equals `value`.
    pub fn latest_filtered(
        &self,
        topic: &TopicKey,
        field: &str,
        value: &str,
    ) -> Result<Option<&'a Sample>, EisenbahnError> {
        let cache = self.filter(topic, field)?;
        Ok(cache.get(value))
    }

    /// Latest sample for every value seen on a filtered topic, sorted by value.
    pub fn filtered(&self, topic: &TopicKey, field: &str) -> Result<Vec<&'a Sample>, EisenbahnError> {
        let cache = self.filter(topic, field)?;
        let mut entries: Vec<_> = cache.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        Ok(entries.into_iter().map(|(_, sample)| sample).collect())
    }

    fn filter(
        &self,
        topic: &TopicKey,
        field: &str,
    ) -> Result<&'a HashMap<String, Sample>, EisenbahnError> {
        self.check(topic)?
            .filters
            .get(field)
            .ok_or_else(|| EisenbahnError::NoFilter {
                topic: topic.to_string(),
                field: field.to_string(),
            })
    }
}

/// A rule's view during setup: may install filters on its own topics.
pub struct SetupView<'a> {
    allowed: &'a HashSet<TopicKey>,
    dispatcher: &'a mut TopicDispatcher,
}

impl SetupView<'_> {
    /// Keep the latest sample per distinct value of `field` on `topic`.
    pub fn filter(&mut self, topic: &TopicKey, field: &str) -> Result<(), EisenbahnError> {
        if !self.allowed.contains(topic) {
            return Err(EisenbahnError::Undeclared(topic.to_string()));
        }
        self.dispatcher.install_filter(topic, field)
    }

    pub fn view(&self) -> SourceView<'_> {
        SourceView {
            allowed: self.allowed,
            dispatcher: &*self.dispatcher,
        }
    }
}
