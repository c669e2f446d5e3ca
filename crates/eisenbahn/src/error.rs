use thiserror::Error;

/// Errors that can occur in the dispatch and messaging layer.
#[derive(Debug, Error)]
pub enum EisenbahnError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid source name: {0:?}")]
    InvalidSource(String),

    #[error("invalid wire topic: {0:?}")]
    InvalidTopic(String),

    #[error("topic {0} was not declared by this rule")]
    Undeclared(String),

    #[error("no filter on field {field:?} for topic {topic}")]
    NoFilter { topic: String, field: String },
}
