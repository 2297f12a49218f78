#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON-lines logging shared by every control domain of the line.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Recoverable anomaly.
    Warn,
    /// Failure that needs operator attention.
    Error,
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Wall-clock timestamp (ISO8601).
    pub timestamp: DateTime<Utc>,
    /// Component emitting the record (e.g. `belt.controller`).
    pub component: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted message key, e.g. `belt.safety.trip`.
    pub message: String,
    /// Arbitrary JSON fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record without metadata.
    #[must_use]
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Adds a single metadata field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merges every field of a JSON object into the metadata; other values are ignored.
    #[must_use]
    pub fn with_object(mut self, value: &serde_json::Value) -> Self {
        if let Some(obj) = value.as_object() {
            for (key, field) in obj {
                self.metadata.insert(key.clone(), field.clone());
            }
        }
        self
    }
}

/// Thread-safe append-only JSON-lines logger with a minimum level filter.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    min_level: LogLevel,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path, accepting every level.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_min_level(path, LogLevel::Debug)
    }

    /// Creates or opens a logger that drops records below `min_level`.
    pub fn with_min_level(path: impl AsRef<Path>, min_level: LogLevel) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            min_level,
            writer: Mutex::new(file),
        })
    }

    /// Writes a record as one JSON line. Returns `false` when the record was filtered.
    pub fn log(&self, record: &LogRecord) -> Result<bool> {
        if record.level < self.min_level {
            return Ok(false);
        }
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(true)
    }

    /// Minimum level accepted by this logger.
    #[must_use]
    pub const fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Returns the underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines_with_fields() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("line.log")).unwrap();
        let record = LogRecord::new("belt.controller", LogLevel::Warn, "belt.safety.trip")
            .with_field("timeout_s", 10.0);
        assert!(logger.log(&record).unwrap());
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"belt.safety.trip\""));
        assert!(content.contains("\"timeout_s\":10.0"));
        assert!(content.contains("\"level\":\"WARN\""));
    }

    #[test]
    fn filters_below_min_level() {
        let dir = tempdir().unwrap();
        let logger =
            JsonLogger::with_min_level(dir.path().join("nested/line.log"), LogLevel::Warn).unwrap();
        let kept = logger
            .log(&LogRecord::new("scheduler", LogLevel::Info, "scheduler.tick"))
            .unwrap();
        assert!(!kept);
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn merges_object_metadata() {
        let record = LogRecord::new("consensus", LogLevel::Info, "consensus.decision")
            .with_object(&serde_json::json!({ "track_id": 7, "category": "apple" }));
        assert_eq!(record.metadata.len(), 2);
        assert!(LogLevel::Error > LogLevel::Warn);
    }
}
