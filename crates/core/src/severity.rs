//! Alarm severity levels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Ordered alarm severity: `None < Warning < Serious < Critical`.
///
/// Serialized as the upper-case level name (`"WARNING"`). Deserialization
/// also accepts the numeric codes used by older configuration files
/// (1 = NONE .. 4 = CRITICAL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    None,
    Warning,
    Serious,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::None,
        Severity::Warning,
        Severity::Serious,
        Severity::Critical,
    ];

    pub fn is_none(self) -> bool {
        self == Severity::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "NONE",
            Severity::Warning => "WARNING",
            Severity::Serious => "SERIOUS",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Numeric code, 1 (NONE) through 4 (CRITICAL).
    pub fn code(self) -> u8 {
        match self {
            Severity::None => 1,
            Severity::Warning => 2,
            Severity::Serious => 3,
            Severity::Critical => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Severity::None),
            2 => Some(Severity::Warning),
            3 => Some(Severity::Serious),
            4 => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(Severity::None),
            "WARNING" => Ok(Severity::Warning),
            "SERIOUS" => Ok(Severity::Serious),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(CoreError::UnknownSeverity(other.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Code(i64),
            Name(String),
        }

        match Repr::deserialize(d)? {
            Repr::Code(code) => Severity::from_code(code)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown severity code {code}"))),
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}
