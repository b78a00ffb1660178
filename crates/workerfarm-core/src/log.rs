//! Process-wide log bus for events produced inside workers.
//!
//! The bus is an explicit object: the farm and every worker context get
//! a handle at construction instead of reaching for a global.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Where an event came from: a structured log call or a raw text stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Log,
    Stream,
}

/// Standard text stream of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    /// Severity of an untagged line on this stream
    pub fn default_level(&self) -> LogLevel {
        match self {
            StdStream::Stdout => LogLevel::Info,
            StdStream::Stderr => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    #[serde(rename = "type")]
    pub source: LogSource,
}

impl LogEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        LogEvent {
            level,
            message: message.into(),
            source: LogSource::Log,
        }
    }

    pub fn stream(level: LogLevel, message: impl Into<String>) -> Self {
        LogEvent {
            level,
            message: message.into(),
            source: LogSource::Stream,
        }
    }
}

type Listener = Arc<dyn Fn(&LogEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

/// Subscribe-by-callback event bus; cheap to clone
#[derive(Clone, Default)]
pub struct LogBus {
    inner: Arc<BusInner>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned
    /// handle is disposed or dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn publish(&self, event: LogEvent) {
        // Snapshot so a listener may subscribe or dispose without deadlocking
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}

impl std::fmt::Debug for LogBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Disposable handle returned by [`LogBus::subscribe`]
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_subscribe_and_dispose() {
        let bus = LogBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let subscription = bus.subscribe(move |event| sink.lock().push(event.clone()));
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(LogEvent::log(LogLevel::Info, "first"));
        subscription.dispose();
        bus.publish(LogEvent::log(LogLevel::Info, "second"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "first");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_every_listener_sees_event() {
        let bus = LogBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let a = count.clone();
        let _first = bus.subscribe(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let b = count.clone();
        let _second = bus.subscribe(move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(LogEvent::stream(LogLevel::Error, "boom"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_shape() {
        let event = LogEvent::log(LogLevel::Warn, "careful");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"level": "warn", "message": "careful", "type": "log"})
        );
    }

    #[test]
    fn test_stream_default_levels() {
        assert_eq!(StdStream::Stdout.default_level(), LogLevel::Info);
        assert_eq!(StdStream::Stderr.default_level(), LogLevel::Error);
    }
}
