use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Validation(String),

    #[error("env var {0} must be set")]
    MissingEnv(String),

    #[error("unknown severity: {0}")]
    UnknownSeverity(String),
}
