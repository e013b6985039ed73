//! Audit and maintenance event log.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warning,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLevel::Info => write!(f, "info"),
            EventLevel::Warning => write!(f, "warning"),
        }
    }
}

/// Receives notable events from maintenance jobs.
pub trait EventSink: Send + Sync {
    fn publish(&self, level: EventLevel, topic: &str, message: &str);

    fn info(&self, topic: &str, message: &str) {
        self.publish(EventLevel::Info, topic, message);
    }

    fn warn(&self, topic: &str, message: &str) {
        self.publish(EventLevel::Warning, topic, message);
    }
}

/// Writes events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, level: EventLevel, topic: &str, message: &str) {
        match level {
            EventLevel::Info => tracing::info!(topic, "{}", message),
            EventLevel::Warning => tracing::warn!(topic, "{}", message),
        }
    }
}
