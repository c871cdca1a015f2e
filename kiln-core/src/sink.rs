//! Operator-facing log sinks
//!
//! Every component reports progress (build output lines, upload percentages,
//! import polling) through a [`LogSink`] handed to it at construction. The
//! CLI provides a console sink, libraries default to [`TracingSink`], and
//! tests capture output with [`MemorySink`].

use std::sync::Mutex;

use crate::domain::log::{LogEntry, LogLevel};

/// Trait for log sinks
///
/// Implementations must be shareable across the stdout and stderr reader
/// tasks of a running build, hence `&self` and `Send + Sync`.
pub trait LogSink: Send + Sync {
    /// Write a log message
    fn write(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.write(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.write(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.write(LogLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.write(LogLevel::Error, message);
    }
}

/// Forwards every message to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "kiln", "{}", message),
            LogLevel::Info => tracing::info!(target: "kiln", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "kiln", "{}", message),
            LogLevel::Error => tracing::error!(target: "kiln", "{}", message),
        }
    }
}

/// Keeps every entry in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.message).collect()
    }

    /// True when any recorded message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries().iter().any(|e| e.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write(&self, level: LogLevel, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LogEntry::new(level, message));
    }
}

impl<S: LogSink + ?Sized> LogSink for std::sync::Arc<S> {
    fn write(&self, level: LogLevel, message: &str) {
        (**self).write(level, message);
    }
}
