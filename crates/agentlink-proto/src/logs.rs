//! Agent log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::tools::ProtoError;

/// Source id used when an agent uploads logs without naming a source
pub const EXTERNAL_LOG_SOURCE_ID: Uuid = Uuid::from_u128(0x3b57_9bf4_1ed8_4b99_87a8_e9a1_e341_0410);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level as sent by agents; older agents omit it, which means `info`
    pub fn parse_or_default(raw: &str) -> Result<Self, ProtoError> {
        if raw.is_empty() {
            return Ok(LogLevel::Info);
        }
        raw.parse()
    }
}

impl FromStr for LogLevel {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ProtoError::InvalidLogLevel(other.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// A persisted log line. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub level: LogLevel,
    pub source_id: Uuid,
    pub output: String,
}

/// A log line as uploaded by an agent, before it has been assigned an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub level: LogLevel,
    pub output: String,
}

impl NewLogEntry {
    pub fn new(level: LogLevel, output: impl Into<String>) -> Self {
        Self {
            level,
            output: output.into(),
        }
    }

    pub fn info(output: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!(LogLevel::parse_or_default("").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::parse_or_default("warn").unwrap(), LogLevel::Warn);
        assert!(matches!(
            LogLevel::parse_or_default("loud"),
            Err(ProtoError::InvalidLogLevel(level)) if level == "loud"
        ));
    }

    #[test]
    fn test_level_serializes_lowercase() {
        let json = serde_json::to_string(&LogLevel::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }
}
