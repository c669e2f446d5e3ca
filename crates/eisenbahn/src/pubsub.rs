use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket, ZmqMessage};

use crate::error::EisenbahnError;
use crate::message::Message;
use crate::source::SourceKey;
use crate::topics;
use crate::traits::{EventPublisher, SampleFeed, SampleSource};
use crate::transport::Transport;

/// ZeroMQ PUB socket.
///
/// Messages go out as two frames:
/// 1. Wire topic (SUB sockets prefix-filter on it)
/// 2. MessagePack-encoded [`Message`] envelope
pub struct ZmqPublisher {
    socket: Mutex<PubSocket>,
}

impl ZmqPublisher {
    /// Bind to `transport`; subscribers connect to it.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, EisenbahnError> {
        transport.ensure_ipc_dir().map_err(|e| EisenbahnError::Transport(e.to_string()))?;
        transport
            .remove_stale_socket()
            .map_err(|e| EisenbahnError::Transport(e.to_string()))?;
        let mut socket = PubSocket::new();
        info!("binding PUB socket");
        socket.bind(&transport.endpoint()).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Connect to a forwarding device that binds its SUB side.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, EisenbahnError> {
        let mut socket = PubSocket::new();
        info!("connecting PUB socket");
        socket.connect(&transport.endpoint()).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl EventPublisher for ZmqPublisher {
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError> {
        let mut frames = ZmqMessage::from(message.topic.as_str());
        frames.push_back(message.to_bytes()?.into());

        self.socket.lock().await.send(frames).await?;
        debug!(topic = %message.topic, "published message");
        Ok(())
    }
}

/// Decode a received two-frame ZMQ message into its envelope.
fn decode_frames(zmq_msg: &ZmqMessage) -> Result<Message, EisenbahnError> {
    let frames: Vec<_> = zmq_msg.iter().collect();
    match frames.as_slice() {
        [_topic, envelope, ..] => Message::from_bytes(envelope.as_ref()),
        [envelope] => Message::from_bytes(envelope.as_ref()),
        [] => Err(EisenbahnError::Transport("empty ZMQ message".into())),
    }
}

/// Sample source reading from a ZeroMQ PUB endpoint.
///
/// Each opened connection is one SUB socket subscribed to the wire topics
/// of the requested source, drained by its own task into the sample feed.
pub struct ZmqSampleSource {
    transport: Transport,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl ZmqSampleSource {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            readers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SampleSource for ZmqSampleSource {
    #[instrument(skip_all, fields(source = %source, endpoint = %self.transport))]
    async fn open(
        &self,
        source: &SourceKey,
        topic_names: &[String],
        feed: SampleFeed,
    ) -> Result<(), EisenbahnError> {
        let mut socket = SubSocket::new();
        socket.connect(&self.transport.endpoint()).await?;

        let mut wanted = HashSet::new();
        for name in topic_names {
            let key = source.topic(name.as_str());
            // SUB filtering is by prefix; exact matching happens on receive.
            socket.subscribe(&topics::sample_topic(&key)).await?;
            wanted.insert(key);
        }
        info!(topics = topic_names.len(), "opened sample connection");

        let source = source.clone();
        let reader = tokio::spawn(async move {
            loop {
                let zmq_msg = match socket.recv().await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(source = %source, error = %e, "sample connection closed");
                        break;
                    }
                };
                let sample = match decode_frames(&zmq_msg).and_then(Message::into_sample) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(source = %source, error = %e, "dropping undecodable sample");
                        continue;
                    }
                };
                if !wanted.contains(&sample.topic) {
                    continue;
                }
                if feed.send(sample).is_err() {
                    debug!(source = %source, "sample feed closed, stopping reader");
                    break;
                }
            }
        });
        self.readers.lock().await.push(reader);
        Ok(())
    }

    async fn close(&self) {
        let mut readers = self.readers.lock().await;
        for reader in readers.drain(..) {
            reader.abort();
        }
        info!(endpoint = %self.transport, "closed sample connections");
    }
}
