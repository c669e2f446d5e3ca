//! Topic dispatch and transport plumbing for the watcher.
//!
//! This crate provides:
//! - Source/topic keys and the [`Sample`] type delivered to rules
//! - [`TopicDispatcher`]: shared connections and subscriptions with
//!   per-rule isolated [`SourceView`]s
//! - The [`Message`] wire envelope (MessagePack)
//! - ZeroMQ adapters for the sample source and alarm publication

pub mod dispatch;
pub mod error;
pub mod message;
pub mod pubsub;
pub mod source;
pub mod topics;
pub mod traits;
pub mod transport;

pub use dispatch::{RuleId, SetupView, SourceView, TopicDispatcher};
pub use error::EisenbahnError;
pub use message::Message;
pub use pubsub::{ZmqPublisher, ZmqSampleSource};
pub use source::{DeliveryMode, Sample, SourceDescriptor, SourceKey, TopicKey};
pub use traits::{EventPublisher, SampleFeed, SampleSource};
pub use transport::Transport;
