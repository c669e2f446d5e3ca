pub mod config;
pub mod error;
pub mod severity;

pub use config::{load_dotenv, seconds, EscalationEntry, RuleSet, WatcherConfig};
pub use error::CoreError;
pub use severity::Severity;
