//! Process log: structured runtime events fanned out to pluggable sinks.
//!
//! ```text
//! StepActor / ProcessActor / KernelProcessContext
//!           │
//!           ▼
//!    ProcessLogger::log(entry)
//!           │
//!       ┌───┴────┐
//!       ▼        ▼
//!  TracingSink MemorySink
//! ```
//!
//! The runtime logs through a [`ProcessLogger`] owned by the runtime, so tests
//! can attach a [`MemorySink`] and assert on what a run reported.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ActorId;

/// Severity levels for process log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A structured log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Component that produced the entry (e.g. "process", "step", "context").
    pub source: String,
    /// Actor the entry concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl LogEntry {
    /// Entry stamped with the current time.
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            actor_id: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_actor(mut self, actor_id: &ActorId) -> Self {
        self.actor_id = Some(actor_id.clone());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Output sink for log entries. Must be `Send + Sync` for concurrent use.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);
}

/// Dispatches entries at or above a minimum level to every attached sink.
pub struct ProcessLogger {
    sinks: Vec<Arc<dyn LogSink>>,
    min_level: LogLevel,
}

impl ProcessLogger {
    /// Logger with no sinks that accepts every level.
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            min_level: LogLevel::Trace,
        }
    }

    /// Logger that forwards to `tracing` at `level` and above.
    pub fn tracing(level: LogLevel) -> Self {
        let mut logger = Self::new().with_level(level);
        logger.add_sink(Arc::new(TracingSink));
        logger
    }

    /// Builder: set the minimum level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Set the minimum level.
    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Builder: attach a sink.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Attach a sink.
    pub fn add_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }

    /// Whether entries at `level` reach the sinks.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Send `entry` to every sink if its level is enabled.
    pub fn log(&self, entry: &LogEntry) {
        if !self.enabled(entry.level) {
            return;
        }
        for sink in &self.sinks {
            sink.write(entry);
        }
    }

    /// Convenience: log at trace level.
    pub fn trace(&self, source: &str, actor: &ActorId, message: &str) {
        self.log(&LogEntry::new(LogLevel::Trace, source, message).with_actor(actor));
    }

    /// Convenience: log at debug level.
    pub fn debug(&self, source: &str, actor: &ActorId, message: &str) {
        self.log(&LogEntry::new(LogLevel::Debug, source, message).with_actor(actor));
    }

    /// Convenience: log at info level.
    pub fn info(&self, source: &str, actor: &ActorId, message: &str) {
        self.log(&LogEntry::new(LogLevel::Info, source, message).with_actor(actor));
    }

    /// Convenience: log at warn level.
    pub fn warn(&self, source: &str, actor: &ActorId, message: &str) {
        self.log(&LogEntry::new(LogLevel::Warn, source, message).with_actor(actor));
    }

    /// Convenience: log at error level.
    pub fn error(&self, source: &str, actor: &ActorId, message: &str) {
        self.log(&LogEntry::new(LogLevel::Error, source, message).with_actor(actor));
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl Default for ProcessLogger {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Built-in Sinks ────────────────────────────────────────────────────────

/// Forwards entries to the `tracing` macros at the matching level.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, entry: &LogEntry) {
        let actor = entry.actor_id.as_ref().map(ActorId::as_str).unwrap_or("-");
        let source = entry.source.as_str();
        let message = entry.message.as_str();
        match entry.level {
            LogLevel::Trace => tracing::trace!(source, actor, "{message}"),
            LogLevel::Debug => tracing::debug!(source, actor, "{message}"),
            LogLevel::Info => tracing::info!(source, actor, "{message}"),
            LogLevel::Warn => tracing::warn!(source, actor, "{message}"),
            LogLevel::Error => tracing::error!(source, actor, "{message}"),
        }
    }
}

/// Collects entries in memory for inspection.
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    // A panicking writer cannot leave a half-pushed entry, so the poisoned
    // guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn at_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.lock()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemorySink {
    fn write(&self, entry: &LogEntry) {
        self.lock().push(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_entry_creates() {
        let entry = LogEntry::new(LogLevel::Info, "process", "superstep 1");
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.source, "process");
        assert!(entry.actor_id.is_none());
        assert!(entry.payload.is_none());
    }

    #[test]
    fn log_entry_serializes_roundtrip() {
        let entry = LogEntry::new(LogLevel::Warn, "process", "limit")
            .with_actor(&ActorId::new("p"))
            .with_payload(json!({"supersteps": 100}));
        let json = serde_json::to_string(&entry).unwrap();
        let deser: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(deser.level, LogLevel::Warn);
        assert_eq!(deser.actor_id, Some(ActorId::new("p")));
        assert_eq!(deser.payload.unwrap()["supersteps"], 100);
    }

    #[test]
    fn log_level_ordering_and_serde() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "\"warn\"");
    }

    #[test]
    fn logger_level_filter() {
        let sink = Arc::new(MemorySink::new());
        let logger = ProcessLogger::new()
            .with_level(LogLevel::Warn)
            .with_sink(sink.clone());
        let actor = ActorId::new("p");

        logger.debug("process", &actor, "ignored");
        logger.info("process", &actor, "ignored too");
        logger.warn("process", &actor, "visible");
        logger.error("step", &actor, "visible too");

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.at_level(LogLevel::Error).len(), 1);
        assert!(!logger.enabled(LogLevel::Info));
    }

    #[test]
    fn logger_multiple_sinks() {
        let sink1 = Arc::new(MemorySink::new());
        let sink2 = Arc::new(MemorySink::new());
        let mut logger = ProcessLogger::new();
        logger.add_sink(sink1.clone());
        logger.add_sink(sink2.clone());

        logger.info("process", &ActorId::new("p"), "broadcast");

        assert_eq!(sink1.len(), 1);
        assert_eq!(sink2.len(), 1);
        assert_eq!(logger.sink_count(), 2);
    }

    #[test]
    fn tracing_logger_has_one_sink() {
        let logger = ProcessLogger::tracing(LogLevel::Info);
        assert_eq!(logger.sink_count(), 1);
        // no subscriber installed; must not panic
        logger.info("process", &ActorId::new("p"), "hello");
    }

    #[test]
    fn memory_sink_clear() {
        let sink = MemorySink::new();
        sink.write(&LogEntry::new(LogLevel::Info, "test", "msg"));
        assert!(!sink.is_empty());
        sink.clear();
        assert!(sink.is_empty());
    }
}
