use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// One diagnostic line, tagged with the pipeline component that emitted it.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub component: &'static str,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, component: &'static str, message: impl Into<String>) -> Self {
        Self {
            level,
            component,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.component, self.message)
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);

    fn debug(&self, component: &'static str, message: String) {
        self.log(LogRecord::new(LogLevel::Debug, component, message));
    }

    fn info(&self, component: &'static str, message: String) {
        self.log(LogRecord::new(LogLevel::Info, component, message));
    }

    fn warn(&self, component: &'static str, message: String) {
        self.log(LogRecord::new(LogLevel::Warn, component, message));
    }

    fn error(&self, component: &'static str, message: String) {
        self.log(LogRecord::new(LogLevel::Error, component, message));
    }
}

pub type SharedLogSink = Arc<dyn LogSink>;

#[derive(Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn log(&self, _record: LogRecord) {}
}

/// Keeps every record in memory; used by tests to assert on diagnostics.
#[derive(Default)]
pub struct VecLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl VecLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|record| record.level == level)
            .map(|record| record.message)
            .collect()
    }
}

impl LogSink for VecLogSink {
    fn log(&self, record: LogRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }
}

/// Writes records at or above `min_level` to stderr, leaving stdout for book text.
#[derive(Clone)]
pub struct StderrLogSink {
    min_level: LogLevel,
}

impl StderrLogSink {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }
}

impl Default for StderrLogSink {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl LogSink for StderrLogSink {
    fn log(&self, record: LogRecord) {
        if record.level >= self.min_level {
            eprintln!("{record}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_tag_level_and_component() {
        let sink = VecLogSink::new();
        sink.info("pipeline", "concept ready".into());
        sink.warn("dispatcher", "retrying".into());

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, LogLevel::Info);
        assert_eq!(records[1].component, "dispatcher");
        assert_eq!(sink.messages_at(LogLevel::Warn), vec!["retrying"]);
        assert_eq!(records[1].to_string(), "[WARN] dispatcher: retrying");
    }
}
