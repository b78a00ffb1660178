//! Re-publishes output produced inside a worker on the farm's log bus.
//!
//! Structured log records keep their level. Stream text is split into
//! lines and each line is classified: a leading level tag (`[warn]`,
//! `Error:`, `INFO`, optionally after a timestamp) wins, otherwise the
//! stream's default applies (info for stdout, error for stderr).
//! Ordering holds only within one stream of one worker.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{trace, warn};
use workerfarm_core::{LogBus, LogEvent, LogLevel, StdStream, WorkerId};
use workerfarm_protocol::{EventSink, LogRecord, StreamChunk};

pub struct OutputRouter {
    bus: LogBus,
    worker: WorkerId,
    partial: Mutex<HashMap<StdStream, String>>,
}

impl OutputRouter {
    pub fn new(bus: LogBus, worker: WorkerId) -> Self {
        OutputRouter {
            bus,
            worker,
            partial: Mutex::new(HashMap::new()),
        }
    }

    pub fn route_log(&self, record: LogRecord) {
        trace!(worker = %self.worker, level = record.level.as_str(), "Worker log");
        self.bus.publish(LogEvent::log(record.level, record.message));
    }

    /// Buffer `chunk` and publish every line it completes
    pub fn route_stream(&self, chunk: StreamChunk) {
        let lines = {
            let mut partial = self.partial.lock();
            let buffer = partial.entry(chunk.stream).or_default();
            buffer.push_str(&chunk.text);

            let mut lines = Vec::new();
            while let Some(end) = buffer.find('\n') {
                let line: String = buffer.drain(..=end).collect();
                lines.push(line);
            }
            lines
        };

        for line in lines {
            self.publish_line(chunk.stream, &line);
        }
    }

    /// Publish whatever unterminated text is still buffered
    pub fn flush(&self) {
        let rest: Vec<(StdStream, String)> = self.partial.lock().drain().collect();
        for (stream, text) in rest {
            self.publish_line(stream, &text);
        }
    }

    /// Forward a raw byte stream line by line until EOF
    pub async fn forward_raw<R>(&self, stream: StdStream, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.publish_line(stream, &line),
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = %self.worker, "Failed to read worker output: {}", e);
                    break;
                }
            }
        }
    }

    fn publish_line(&self, stream: StdStream, line: &str) {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return;
        }
        let level = classify_line(line, stream.default_level());
        self.bus.publish(LogEvent::stream(level, line));
    }
}

impl EventSink for OutputRouter {
    fn on_log(&self, record: LogRecord) {
        self.route_log(record);
    }

    fn on_stream(&self, chunk: StreamChunk) {
        self.route_stream(chunk);
    }
}

/// Severity of one output line
pub fn classify_line(line: &str, default: LogLevel) -> LogLevel {
    let mut tokens = line.split_whitespace();
    let tag = match tokens.next() {
        // Level column after a timestamp
        Some(first) if first.starts_with(|c: char| c.is_ascii_digit()) => tokens.next(),
        first => first,
    };
    tag.and_then(level_tag).unwrap_or(default)
}

/// A token counts as a tag only when marked as one: bracketed, followed
/// by a colon, or written in capitals
fn level_tag(token: &str) -> Option<LogLevel> {
    let word = token.trim_matches(|c: char| !c.is_ascii_alphabetic());
    let marked = token.starts_with('[')
        || token.ends_with(':')
        || word.chars().all(|c| c.is_ascii_uppercase());
    if word.is_empty() || !marked {
        return None;
    }
    match word.to_ascii_lowercase().as_str() {
        "error" | "err" | "fatal" => Some(LogLevel::Error),
        "warn" | "warning" => Some(LogLevel::Warn),
        "info" | "debug" | "trace" => Some(LogLevel::Info),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;

    fn collect(bus: &LogBus) -> (Arc<SyncMutex<Vec<LogEvent>>>, workerfarm_core::Subscription) {
        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink = events.clone();
        let sub = bus.subscribe(move |event: &LogEvent| sink.lock().push(event.clone()));
        (events, sub)
    }

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line("hello", LogLevel::Info), LogLevel::Info);
        assert_eq!(classify_line("[warn] disk low", LogLevel::Info), LogLevel::Warn);
        assert_eq!(classify_line("Error: bad", LogLevel::Info), LogLevel::Error);
        assert_eq!(
            classify_line("2026-01-01T00:00:00Z  WARN slow", LogLevel::Error),
            LogLevel::Warn
        );
        assert_eq!(classify_line("a b error", LogLevel::Info), LogLevel::Info);
        assert_eq!(classify_line("plain", LogLevel::Error), LogLevel::Error);
    }

    #[test]
    fn test_level_words_in_text_are_not_tags() {
        assert_eq!(classify_line("No error found", LogLevel::Info), LogLevel::Info);
        assert_eq!(classify_line("error handling works", LogLevel::Info), LogLevel::Info);
        assert_eq!(classify_line("ok WARN later", LogLevel::Info), LogLevel::Info);
        assert_eq!(classify_line("12 items, error free", LogLevel::Info), LogLevel::Info);
        assert_eq!(classify_line("ERROR: disk", LogLevel::Info), LogLevel::Error);
    }

    #[test]
    fn test_stream_chunks_split_into_lines() {
        let bus = LogBus::new();
        let (events, _sub) = collect(&bus);
        let router = OutputRouter::new(bus, WorkerId(1));

        router.route_stream(StreamChunk { stream: StdStream::Stdout, text: "on".into() });
        router.route_stream(StreamChunk { stream: StdStream::Stdout, text: "e\ntwo\nthr".into() });
        router.route_stream(StreamChunk { stream: StdStream::Stderr, text: "oops\n".into() });
        assert_eq!(events.lock().len(), 3);

        router.flush();
        let events = events.lock().clone();
        assert_eq!(
            events,
            vec![
                LogEvent::stream(LogLevel::Info, "one"),
                LogEvent::stream(LogLevel::Info, "two"),
                LogEvent::stream(LogLevel::Error, "oops"),
                LogEvent::stream(LogLevel::Info, "thr"),
            ]
        );
    }

    #[test]
    fn test_log_records_keep_level() {
        let bus = LogBus::new();
        let (events, _sub) = collect(&bus);
        let router = OutputRouter::new(bus, WorkerId(1));

        router.on_log(LogRecord { level: LogLevel::Warn, message: "careful".into() });
        assert_eq!(*events.lock(), vec![LogEvent::log(LogLevel::Warn, "careful")]);
    }

    #[tokio::test]
    async fn test_forward_raw_stderr() {
        let bus = LogBus::new();
        let (events, _sub) = collect(&bus);
        let router = OutputRouter::new(bus, WorkerId(2));

        let raw: &[u8] = b"thread 'main' panicked at src/lib.rs:1:1\n\nINFO ready\n";
        router.forward_raw(StdStream::Stderr, raw).await;

        assert_eq!(
            *events.lock(),
            vec![
                LogEvent::stream(LogLevel::Error, "thread 'main' panicked at src/lib.rs:1:1"),
                LogEvent::stream(LogLevel::Info, "INFO ready"),
            ]
        );
    }
}
