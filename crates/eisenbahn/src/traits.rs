use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EisenbahnError;
use crate::message::Message;
use crate::source::{Sample, SourceKey};

/// Channel on which a [`SampleSource`] delivers samples to the engine.
///
/// Samples are delivered in arrival order.
pub type SampleFeed = mpsc::UnboundedSender<Sample>;

/// Publishes messages to one or more subscribers via PUB/SUB pattern.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a message. Subscribers filter by the message's topic.
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError>;
}

/// Blanket implementation so `Arc<dyn EventPublisher>` can be used directly.
#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError> {
        (**self).publish(message).await
    }
}

/// External data source: owns connection setup, reconnects and decoding.
///
/// The engine opens exactly one connection per [`SourceKey`], after every
/// rule has finished setup, and closes them all at shutdown.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Start delivering samples for `topics` of `source` into `feed`.
    async fn open(
        &self,
        source: &SourceKey,
        topics: &[String],
        feed: SampleFeed,
    ) -> Result<(), EisenbahnError>;

    /// Stop every connection opened by this source.
    async fn close(&self);
}
