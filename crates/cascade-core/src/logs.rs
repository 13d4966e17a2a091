//! Log Broadcaster — fan-out of live output lines per run or session.
//!
//! Each stream key (a run ID or session ID) owns a bounded ring buffer of
//! the most recent lines plus a `tokio::sync::broadcast` sender. Publishing
//! appends to the ring and broadcasts; a slow subscriber lags on its own
//! receiver and loses its oldest unseen lines — it can never block the
//! publisher or other subscribers. Subscribing replays the ring-buffer
//! backlog before switching to live delivery, so a late-joining viewer sees
//! recent history without gaps.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::Stream;

/// Where an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lines emitted by Cascade itself (lifecycle notices, loop iteration
    /// markers) rather than the process.
    System,
}

/// One published output line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub source: LogSource,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(LogSource::Stdout, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(LogSource::Stderr, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(LogSource::System, text)
    }

    fn new(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

struct StreamEntry {
    ring: VecDeque<LogLine>,
    tx: broadcast::Sender<LogLine>,
}

/// Default ring-buffer capacity per stream key.
const DEFAULT_RING_CAPACITY: usize = 1_000;

/// Per-subscriber live queue depth before the oldest unseen lines drop.
const SUBSCRIBER_QUEUE: usize = 256;

/// Process-wide log fan-out. One instance is shared by the engine and the
/// session orchestrator (injected via `AppStateInner`); cloning is cheap.
#[derive(Clone)]
pub struct LogBroadcaster {
    inner: Arc<RwLock<HashMap<String, StreamEntry>>>,
    capacity: usize,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Append a line to the key's ring buffer and push it to every live
    /// subscriber. Never blocks on subscriber speed.
    pub fn publish(&self, key: &str, line: LogLine) {
        let mut map = self.inner.write().expect("log registry poisoned");
        let capacity = self.capacity;
        let entry = map.entry(key.to_string()).or_insert_with(|| StreamEntry {
            ring: VecDeque::with_capacity(capacity.min(64)),
            tx: broadcast::channel(SUBSCRIBER_QUEUE).0,
        });

        if entry.ring.len() == self.capacity {
            entry.ring.pop_front();
        }
        entry.ring.push_back(line.clone());
        // No receivers is fine; the ring keeps the backlog for late joiners.
        let _ = entry.tx.send(line);
    }

    /// Snapshot the backlog and attach a live receiver in one step, so no
    /// line published in between is missed or duplicated.
    pub fn subscribe(&self, key: &str) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        let mut map = self.inner.write().expect("log registry poisoned");
        let capacity = self.capacity;
        let entry = map.entry(key.to_string()).or_insert_with(|| StreamEntry {
            ring: VecDeque::with_capacity(capacity.min(64)),
            tx: broadcast::channel(SUBSCRIBER_QUEUE).0,
        });
        (entry.ring.iter().cloned().collect(), entry.tx.subscribe())
    }

    /// Stream of lines: backlog first, then live delivery. Ends when the
    /// key is closed. Lagged gaps are surfaced as a `system` notice rather
    /// than silently swallowed.
    pub fn stream(&self, key: &str) -> impl Stream<Item = LogLine> + Send + 'static {
        let (backlog, mut rx) = self.subscribe(key);
        async_stream::stream! {
            for line in backlog {
                yield line;
            }
            loop {
                match rx.recv().await {
                    Ok(line) => yield line,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield LogLine::system(format!("[stream lagged; {} lines dropped]", n));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Most recent lines currently buffered for a key.
    pub fn backlog(&self, key: &str) -> Vec<LogLine> {
        let map = self.inner.read().expect("log registry poisoned");
        map.get(key)
            .map(|e| e.ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Terminate all subscriber streams for a key and free its buffer.
    /// Called once the owning run/session reaches terminal status.
    pub fn close(&self, key: &str) {
        let mut map = self.inner.write().expect("log registry poisoned");
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_backlog_replays_before_live() {
        let logs = LogBroadcaster::new();
        logs.publish("run-1", LogLine::stdout("one"));
        logs.publish("run-1", LogLine::stdout("two"));

        let (backlog, mut rx) = logs.subscribe("run-1");
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].text, "one");
        assert_eq!(backlog[1].text, "two");

        logs.publish("run-1", LogLine::stdout("three"));
        let live = rx.recv().await.unwrap();
        assert_eq!(live.text, "three");
    }

    #[tokio::test]
    async fn test_ring_buffer_is_bounded() {
        let logs = LogBroadcaster::with_capacity(3);
        for i in 0..10 {
            logs.publish("k", LogLine::stdout(format!("line-{}", i)));
        }
        let backlog = logs.backlog("k");
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog[0].text, "line-7");
        assert_eq!(backlog[2].text, "line-9");
    }

    #[tokio::test]
    async fn test_slow_subscriber_never_blocks_publish() {
        let logs = LogBroadcaster::new();
        // Subscribe but never read: the receiver's queue fills up.
        let (_backlog, slow_rx) = logs.subscribe("k");

        for i in 0..(SUBSCRIBER_QUEUE * 4) {
            logs.publish("k", LogLine::stdout(format!("{}", i)));
        }

        // A fresh subscriber still observes the latest backlog.
        let (backlog, _rx) = logs.subscribe("k");
        assert_eq!(backlog.last().unwrap().text, format!("{}", SUBSCRIBER_QUEUE * 4 - 1));
        drop(slow_rx);
    }

    #[tokio::test]
    async fn test_two_subscribers_same_order() {
        let logs = LogBroadcaster::new();
        logs.publish("k", LogLine::stdout("a"));

        let s1 = logs.stream("k");
        logs.publish("k", LogLine::stdout("b"));
        let s2 = logs.stream("k");
        logs.publish("k", LogLine::stdout("c"));
        logs.close("k");

        let seen1: Vec<String> = s1.map(|l| l.text).collect().await;
        let seen2: Vec<String> = s2.map(|l| l.text).collect().await;
        assert_eq!(seen1, vec!["a", "b", "c"]);
        // The later subscriber's initial view equals the ring at attach time.
        assert_eq!(seen2, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let logs = LogBroadcaster::new();
        logs.publish("k", LogLine::stdout("only"));
        let stream = logs.stream("k");
        logs.close("k");
        let all: Vec<_> = stream.collect().await;
        assert_eq!(all.len(), 1);
        assert!(logs.backlog("k").is_empty());
    }
}
