use crate::{MainHandlers, OutputRouter};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use workerfarm_core::{FarmError, LogLevel, Result, StdStream};
use workerfarm_protocol::{LogRecord, StreamChunk};
use workerfarm_worker::MainLink;

/// Link for the in-process worker: main-side handlers are called
/// directly and output goes straight to the router.
pub struct LocalLink {
    handlers: MainHandlers,
    router: Arc<OutputRouter>,
}

impl LocalLink {
    pub fn new(handlers: MainHandlers, router: Arc<OutputRouter>) -> Self {
        LocalLink { handlers, router }
    }
}

#[async_trait]
impl MainLink for LocalLink {
    async fn call_main(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.handlers
            .invoke(method, args)
            .await
            .map_err(FarmError::from)
    }

    fn log(&self, level: LogLevel, message: String) {
        self.router.route_log(LogRecord { level, message });
    }

    fn write(&self, stream: StdStream, text: String) {
        self.router.route_stream(StreamChunk { stream, text });
    }

    fn is_remote(&self) -> bool {
        false
    }
}
