//! In-process log buffer behind the `/api/logs` endpoint.
//!
//! A `tracing` layer captures every event into a bounded ring. The sink is
//! injected, not global, so tests can assert on emitted records.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    /// The event target, e.g. `snowglobe::executor`.
    pub logger: String,
    pub module: String,
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
}

#[derive(Clone)]
pub struct LogSink {
    records: Arc<Mutex<VecDeque<LogRecord>>>,
    capacity: usize,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, rec: LogRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(rec);
    }

    /// Newest-first snapshot filtered by level (exact match, upper-cased).
    pub fn snapshot(&self, level: Option<&str>, limit: usize) -> Vec<LogRecord> {
        let wanted = level.map(str::to_ascii_uppercase);
        self.records
            .lock()
            .iter()
            .rev()
            .filter(|r| wanted.as_deref().is_none_or(|w| r.level == w))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The layer feeding this sink; register it on the subscriber registry.
    pub fn layer(&self) -> BufferLayer {
        BufferLayer { sink: self.clone() }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct BufferLayer {
    sink: LogSink,
}

impl<S: Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink.push(LogRecord {
            timestamp: Utc::now(),
            level: meta.level().to_string().to_ascii_uppercase(),
            logger: meta.target().to_owned(),
            module: meta.module_path().unwrap_or_default().to_owned(),
            function: meta.name().to_owned(),
            line: meta.line(),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(&format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(&format!("{}={value}", field.name()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(level: &str, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: level.to_owned(),
            logger: "test".into(),
            module: "test".into(),
            function: String::new(),
            line: None,
            message: message.to_owned(),
        }
    }

    #[test]
    fn buffer_is_bounded() {
        let sink = LogSink::new(2);
        sink.push(rec("INFO", "a"));
        sink.push(rec("INFO", "b"));
        sink.push(rec("INFO", "c"));
        let snap = sink.snapshot(None, 10);
        let msgs: Vec<&str> = snap.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(msgs, ["c", "b"]);
    }

    #[test]
    fn level_filter() {
        let sink = LogSink::new(10);
        sink.push(rec("INFO", "i"));
        sink.push(rec("ERROR", "e"));
        let snap = sink.snapshot(Some("error"), 10);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].message, "e");
    }

    #[test]
    fn layer_captures_events() {
        use tracing_subscriber::prelude::*;
        let sink = LogSink::new(10);
        let subscriber = tracing_subscriber::registry().with(sink.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "snowglobe::test", "something {}", "happened");
        });
        let snap = sink.snapshot(Some("WARN"), 10);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].logger, "snowglobe::test");
        assert!(snap[0].message.contains("something happened"));
    }
}
