//! What task code may do besides computing its result: call back into the
//! initiating process and emit output.
//!
//! Output goes through these methods, never through the process's real
//! stdout: in a child process stdout carries the channel.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use workerfarm_core::{FarmError, LogLevel, Result, StdStream};
use workerfarm_protocol::{Bridge, LogRecord, StreamChunk};

/// Connection from task code to the initiating process
#[async_trait]
pub trait MainLink: Send + Sync {
    async fn call_main(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    fn log(&self, level: LogLevel, message: String);

    fn write(&self, stream: StdStream, text: String);

    /// True inside a child process
    fn is_remote(&self) -> bool;
}

/// Link for a child process: everything travels over the bridge
pub struct BridgeLink {
    bridge: Bridge,
}

impl BridgeLink {
    pub fn new(bridge: Bridge) -> Self {
        BridgeLink { bridge }
    }
}

#[async_trait]
impl MainLink for BridgeLink {
    async fn call_main(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.bridge.call(method, args).await
    }

    fn log(&self, level: LogLevel, message: String) {
        self.bridge.log(LogRecord { level, message });
    }

    fn write(&self, stream: StdStream, text: String) {
        self.bridge.stream(StreamChunk { stream, text });
    }

    fn is_remote(&self) -> bool {
        true
    }
}

/// Link with nobody on the other end, for unit tests of modules
struct Detached;

#[async_trait]
impl MainLink for Detached {
    async fn call_main(&self, method: &str, _args: Vec<Value>) -> Result<Value> {
        Err(FarmError::NestedCallFailure(format!(
            "no initiating process to handle `{}`",
            method
        )))
    }

    fn log(&self, _level: LogLevel, _message: String) {}

    fn write(&self, _stream: StdStream, _text: String) {}

    fn is_remote(&self) -> bool {
        false
    }
}

/// Handle passed to [`TaskModule::run`](crate::TaskModule::run)
#[derive(Clone)]
pub struct WorkerContext {
    link: Arc<dyn MainLink>,
}

impl WorkerContext {
    pub fn new(link: Arc<dyn MainLink>) -> Self {
        WorkerContext { link }
    }

    pub fn detached() -> Self {
        WorkerContext::new(Arc::new(Detached))
    }

    /// Call a handler registered in the initiating process.
    ///
    /// Any failure is reported as [`FarmError::NestedCallFailure`]; the
    /// module decides whether that fails its own call.
    pub async fn call_main(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.link.call_main(method, args).await.map_err(|e| match e {
            FarmError::NestedCallFailure(_) => e,
            FarmError::CallFailure(message) => FarmError::NestedCallFailure(message),
            other => FarmError::NestedCallFailure(other.to_string()),
        })
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.link.log(level, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Raw write; text is split into lines by the receiving side
    pub fn write(&self, stream: StdStream, text: impl Into<String>) {
        self.link.write(stream, text.into());
    }

    pub fn stdout(&self, text: impl Into<String>) {
        self.write(StdStream::Stdout, text);
    }

    pub fn stderr(&self, text: impl Into<String>) {
        self.write(StdStream::Stderr, text);
    }

    pub fn println(&self, line: &str) {
        self.write(StdStream::Stdout, format!("{}\n", line));
    }

    pub fn eprintln(&self, line: &str) {
        self.write(StdStream::Stderr, format!("{}\n", line));
    }

    /// True when running inside a child process rather than in-process
    pub fn is_worker(&self) -> bool {
        self.link.is_remote()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl MainLink for Failing {
        async fn call_main(&self, _method: &str, _args: Vec<Value>) -> Result<Value> {
            Err(FarmError::CallFailure("handler blew up".into()))
        }

        fn log(&self, _level: LogLevel, _message: String) {}

        fn write(&self, _stream: StdStream, _text: String) {}

        fn is_remote(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_main_failures_become_nested_failures() {
        let ctx = WorkerContext::new(Arc::new(Failing));
        let err = ctx.call_main("sum", vec![]).await.unwrap_err();
        assert_eq!(err, FarmError::NestedCallFailure("handler blew up".into()));
        assert!(ctx.is_worker());
    }

    #[tokio::test]
    async fn test_detached_context() {
        let ctx = WorkerContext::detached();
        assert!(!ctx.is_worker());
        assert!(matches!(
            ctx.call_main("pid", vec![]).await,
            Err(FarmError::NestedCallFailure(_))
        ));
    }
}
