use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

// Default capacity can be overridden at runtime:
//   SESSION_ANALYZER_LOG_BUFFER_CAPACITY=5000
const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// One captured tracing event, including its structured fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp: String,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    #[serde(default)]
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Thread-safe circular buffer for storing log entries
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    sequence_counter: Arc<AtomicU64>,
}

impl LogBuffer {
    pub fn new() -> Self {
        let capacity = std::env::var("SESSION_ANALYZER_LOG_BUFFER_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_LOG_CAPACITY);
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            sequence_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Add a log entry to the buffer, removing old entries if needed
    pub fn push(&self, mut entry: LogEntry) {
        entry.sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
    }

    /// Get the last N log entries, up to the buffer size
    pub fn get_last(&self, count: usize) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => {
                let take_count = count.min(entries.len());
                entries
                    .iter()
                    .skip(entries.len() - take_count)
                    .cloned()
                    .collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn get_all(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Entries whose message contains `needle`
    pub fn find(&self, needle: &str) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|entry| entry.message.contains(needle))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracing layer that writes log entries to an in-memory buffer
pub struct MemoryLogLayer {
    buffer: LogBuffer,
}

impl MemoryLogLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    fn convert_level(level: &tracing::Level) -> LogLevel {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for EventVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.push((field.name().to_string(), rendered));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

impl<S> Layer<S> for MemoryLogLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let message = if visitor.message.is_empty() {
            metadata.target().to_string()
        } else {
            visitor.message
        };

        self.buffer.push(LogEntry {
            sequence: 0, // assigned by LogBuffer::push
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%d %H:%M:%S%.3f UTC")
                .to_string(),
            level: Self::convert_level(metadata.level()),
            target: metadata.target().to_string(),
            message,
            fields: visitor.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            sequence: 0,
            timestamp: "2024-01-01 12:00:00.000 UTC".to_string(),
            level: LogLevel::Info,
            target: "test".to_string(),
            message: message.to_string(),
            fields: Vec::new(),
        }
    }

    #[test]
    fn test_log_buffer_circular_behavior() {
        let buffer = LogBuffer::with_capacity(10);
        for i in 0..25 {
            buffer.push(entry(&format!("Message {i}")));
        }

        assert_eq!(buffer.len(), 10);
        let entries = buffer.get_all();
        assert_eq!(entries[0].message, "Message 15");
        assert_eq!(entries[9].message, "Message 24");
        assert_eq!(entries[9].sequence, 24);
    }

    #[test]
    fn test_get_last_entries() {
        let buffer = LogBuffer::with_capacity(100);
        for i in 0..10 {
            buffer.push(entry(&format!("Message {i}")));
        }

        let entries = buffer.get_last(5);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].message, "Message 5");
        assert_eq!(entries[4].message, "Message 9");
        assert_eq!(buffer.get_last(50).len(), 10);
    }

    #[test]
    fn test_layer_captures_structured_fields() {
        let buffer = LogBuffer::with_capacity(100);
        let subscriber =
            tracing_subscriber::registry().with(MemoryLogLayer::new(buffer.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(session = "abc", attempt = 3, "Stop attempt failed");
        });

        let entries = buffer.find("Stop attempt failed");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[0].field("session"), Some("abc"));
        assert_eq!(entries[0].field("attempt"), Some("3"));
    }
}
