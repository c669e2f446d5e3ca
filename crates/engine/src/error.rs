use thiserror::Error;
use vigil_eisenbahn::EisenbahnError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("duplicate alarm name {0:?}")]
    DuplicateAlarm(String),

    #[error("unknown alarm {0:?}")]
    UnknownAlarm(String),

    #[error("invalid mute: {0}")]
    InvalidMute(String),

    #[error("invalid alarm name pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("data source error: {0}")]
    Source(#[from] EisenbahnError),

    #[error("model is not running")]
    Closed,
}

