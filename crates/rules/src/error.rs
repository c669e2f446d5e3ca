use thiserror::Error;
use vigil_eisenbahn::EisenbahnError;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("unknown rule class {0:?}")]
    UnknownClass(String),

    #[error("invalid config for {class}: {message}")]
    InvalidConfig { class: String, message: String },

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error(transparent)]
    Source(#[from] EisenbahnError),
}

impl RuleError {
    pub fn invalid(class: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            class: class.to_string(),
            message: message.into(),
        }
    }
}
