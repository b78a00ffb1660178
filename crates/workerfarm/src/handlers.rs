//! Handlers in the initiating process that workers reach through
//! [`WorkerContext::call_main`](workerfarm_worker::WorkerContext::call_main).

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use workerfarm_core::{RemoteError, RemoteErrorKind};
use workerfarm_protocol::{Bridge, CallHandler};

#[async_trait]
pub trait MainHandler: Send + Sync {
    async fn handle(&self, args: Vec<Value>) -> Result<Value, String>;
}

/// Answers `pid` with the initiating process id
pub struct ProcessIdHandler;

#[async_trait]
impl MainHandler for ProcessIdHandler {
    async fn handle(&self, _args: Vec<Value>) -> Result<Value, String> {
        Ok(Value::from(std::process::id()))
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> MainHandler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync,
{
    async fn handle(&self, args: Vec<Value>) -> Result<Value, String> {
        (self.0)(args)
    }
}

/// Named handlers shared by every worker of a farm
#[derive(Clone, Default)]
pub struct MainHandlers {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MainHandler>>>>,
}

impl MainHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `pid` handler
    pub fn with_defaults() -> Self {
        let handlers = Self::new();
        handlers.register("pid", ProcessIdHandler);
        handlers
    }

    pub fn register<H: MainHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(name, FnHandler(f));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        let handler = self.handlers.read().get(method).cloned();
        let Some(handler) = handler else {
            debug!(method, "No main handler registered");
            return Err(RemoteError::new(RemoteErrorKind::UnknownMethod, method));
        };
        handler.handle(args).await.map_err(RemoteError::call)
    }
}

#[async_trait]
impl CallHandler for MainHandlers {
    async fn handle_call(
        &self,
        _bridge: &Bridge,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RemoteError> {
        self.invoke(method, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_default_pid_handler() {
        let handlers = MainHandlers::with_defaults();
        let pid = handlers.invoke("pid", vec![]).await.unwrap();
        assert_eq!(pid, json!(std::process::id()));
    }

    #[tokio::test]
    async fn test_register_fn_and_unknown() {
        let handlers = MainHandlers::new();
        handlers.register_fn("sum", |args| {
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        });
        handlers.register_fn("nope", |_| Err("not today".to_string()));

        assert_eq!(handlers.invoke("sum", vec![json!(1), json!(2)]).await.unwrap(), json!(3));
        assert_eq!(
            handlers.invoke("nope", vec![]).await.unwrap_err(),
            RemoteError::call("not today")
        );
        assert_eq!(
            handlers.invoke("missing", vec![]).await.unwrap_err().kind,
            RemoteErrorKind::UnknownMethod
        );
        assert_eq!(handlers.names(), vec!["nope".to_string(), "sum".to_string()]);
    }
}
