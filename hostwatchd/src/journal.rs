//! In-memory service journal
//!
//! Append-only, ordered record of everything the agent does. Every task of a
//! running service writes here; the control API serves snapshots of it.
//! Each append is mirrored to `tracing` and published on a broadcast feed so
//! a presentation layer can follow the journal without being wired into the
//! loops themselves.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FEED_BUFFER: usize = 256;

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogEntry {
    /// `"YYYY-MM-DD HH:MM:SS: message"`, the form served by `GET /logs`.
    pub fn render(&self) -> String {
        format!(
            "{}: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.message
        )
    }
}

/// Events published to journal subscribers.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Appended(LogEntry),
    /// A `logs` directive asked observers to redraw their view.
    RefreshRequested,
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

pub struct LogSink {
    entries: Mutex<Vec<LogEntry>>,
    feed: broadcast::Sender<LogEvent>,
}

impl LogSink {
    pub fn new() -> Self {
        let (feed, _receiver) = broadcast::channel(FEED_BUFFER);
        Self {
            entries: Mutex::new(Vec::new()),
            feed,
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(Level::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.append(Level::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(Level::Error, message.into());
    }

    /// Appends a pretty-printed JSON document as a single entry.
    pub fn info_json(&self, value: &Value) {
        let message = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        self.append(Level::Info, message);
    }

    fn append(&self, level: Level, message: String) {
        let mut entries = self.lock();

        // Keep timestamps non-decreasing even if the wall clock steps back.
        let mut timestamp = Local::now();
        if let Some(last) = entries.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }

        let entry = LogEntry { timestamp, message };
        match level {
            Level::Info => info!(target: "hostwatchd::journal", "{}", entry.message),
            Level::Warn => warn!(target: "hostwatchd::journal", "{}", entry.message),
            Level::Error => error!(target: "hostwatchd::journal", "{}", entry.message),
        }

        // Published under the lock so subscribers observe journal order.
        let _ = self.feed.send(LogEvent::Appended(entry.clone()));
        entries.push(entry);
    }

    /// Asks subscribers to re-render; the journal itself is unchanged.
    pub fn request_refresh(&self) {
        let _guard = self.lock();
        let _ = self.feed.send(LogEvent::RefreshRequested);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.feed.subscribe()
    }

    /// Rendered entries in append order.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().map(LogEntry::render).collect()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether any entry message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|entry| entry.message.contains(needle))
    }

    /// Index of the first entry whose message contains `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.lock()
            .iter()
            .position(|entry| entry.message.contains(needle))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("entries", &self.len())
            .field("subscribers", &self.feed.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn render_uses_timestamp_prefix() {
        let sink = LogSink::new();
        sink.info("Test log message");

        let entry = sink.entries().pop().unwrap();
        let expected = format!(
            "{}: Test log message",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        assert_eq!(entry.render(), expected);
        assert_eq!(sink.snapshot(), vec![expected]);
    }

    #[test]
    fn append_grows_by_one_and_keeps_order() {
        let sink = LogSink::new();
        sink.info("first");
        sink.warn("second");
        sink.error("third");

        let messages: Vec<String> = sink.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(sink.position("second"), Some(1));
        assert!(!sink.contains("fourth"));
    }

    #[test]
    fn json_entries_are_pretty_printed() {
        let sink = LogSink::new();
        sink.info_json(&serde_json::json!(["a.txt", "b.txt"]));
        assert_eq!(sink.entries()[0].message, "[\n  \"a.txt\",\n  \"b.txt\"\n]");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_totally_ordered() {
        let sink = Arc::new(LogSink::new());
        let mut handles = Vec::new();
        for task in 0..8 {
            let sink = Arc::clone(&sink);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    sink.info(format!("task {task} entry {i}"));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = sink.entries();
        assert_eq!(entries.len(), 400);
        assert!(entries
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));

        // Per-task order survives interleaving.
        for task in 0..8 {
            let prefix = format!("task {task} entry ");
            let seen: Vec<usize> = entries
                .iter()
                .filter_map(|e| e.message.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn subscribers_see_appends_and_refreshes() {
        let sink = LogSink::new();
        let mut feed = sink.subscribe();

        sink.info("hello");
        sink.request_refresh();

        match feed.recv().await.unwrap() {
            LogEvent::Appended(entry) => assert_eq!(entry.message, "hello"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            feed.recv().await.unwrap(),
            LogEvent::RefreshRequested
        ));
        assert_eq!(sink.len(), 1);
    }
}
