//! Child-process side of the farm: serve calls from the parent over
//! stdin/stdout until the parent closes stdin.

use crate::{BridgeLink, ModuleRegistry, TaskModule, WorkerContext};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workerfarm_core::{FarmError, IdAllocator, RemoteError, RemoteErrorKind};
use workerfarm_protocol::{
    Bridge, CallHandler, Channel, DiscardEvents, INIT_METHOD, PING_METHOD, RUN_METHOD,
};

/// Environment variable holding the child's tracing filter
pub const LOG_ENV: &str = "WORKERFARM_LOG";

/// Routes parent calls to the loaded task module
pub struct ChildDispatcher {
    module: Arc<dyn TaskModule>,
    generation: AtomicU64,
}

impl ChildDispatcher {
    pub fn new(module: Arc<dyn TaskModule>) -> Self {
        ChildDispatcher {
            module,
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn init(&self, args: Vec<Value>) -> Result<Value, RemoteError> {
        let mut args = args.into_iter();
        let options = args.next().unwrap_or(Value::Null);
        let generation = args.next().and_then(|g| g.as_u64()).unwrap_or(0);

        self.module
            .init(options)
            .await
            .map_err(|message| RemoteError::new(RemoteErrorKind::Init, message))?;
        self.generation.store(generation, Ordering::Release);

        debug!(generation, "Task module initialized");
        Ok(Value::from(generation))
    }

    async fn run(&self, bridge: &Bridge, args: Vec<Value>) -> Result<Value, RemoteError> {
        let ctx = WorkerContext::new(Arc::new(BridgeLink::new(bridge.clone())));

        match AssertUnwindSafe(self.module.run(&ctx, args)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(RemoteError::call(message)),
            Err(_) => {
                error!("Task module panicked");
                Err(RemoteError::call("task module panicked"))
            }
        }
    }
}

#[async_trait]
impl CallHandler for ChildDispatcher {
    async fn handle_call(
        &self,
        bridge: &Bridge,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RemoteError> {
        match method {
            RUN_METHOD => self.run(bridge, args).await,
            INIT_METHOD => self.init(args).await,
            PING_METHOD => Ok(Value::from("pong")),
            other => Err(RemoteError::new(RemoteErrorKind::UnknownMethod, other)),
        }
    }
}

/// Serve `module` from `registry` over this process's stdio.
///
/// Returns once the parent closes the channel.
pub async fn run_worker_main(registry: &ModuleRegistry, module: &str) -> anyhow::Result<()> {
    let task_module = registry.get(module).ok_or_else(|| {
        anyhow!(
            "no task module named `{}` (known: {})",
            module,
            registry.names().join(", ")
        )
    })?;

    info!(module, pid = std::process::id(), "Worker process starting");

    let bridge = Bridge::spawn(
        Channel::stdio(),
        Arc::new(ChildDispatcher::new(task_module)),
        Arc::new(DiscardEvents),
        IdAllocator::new(),
        FarmError::ChannelClosed,
    );
    bridge.closed().await;

    info!(module, "Parent closed the channel, exiting");
    Ok(())
}

/// Tracing for a child process. Stdout belongs to the channel, so
/// everything goes to stderr, which the parent forwards.
pub fn init_child_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{EchoModule, InitModule};
    use workerfarm_core::WorkerId;

    fn connect(dispatcher: Arc<ChildDispatcher>) -> Bridge {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);

        Bridge::spawn(
            Channel::new(rr, rw),
            dispatcher,
            Arc::new(DiscardEvents),
            IdAllocator::new(),
            FarmError::ChannelClosed,
        );
        Bridge::spawn(
            Channel::new(lr, lw),
            Arc::new(NoMainHandlers),
            Arc::new(DiscardEvents),
            IdAllocator::new(),
            FarmError::WorkerDied { worker: WorkerId(1) },
        )
    }

    struct NoMainHandlers;

    #[async_trait]
    impl CallHandler for NoMainHandlers {
        async fn handle_call(
            &self,
            _bridge: &Bridge,
            method: &str,
            _args: Vec<Value>,
        ) -> Result<Value, RemoteError> {
            Err(RemoteError::new(RemoteErrorKind::UnknownMethod, method))
        }
    }

    #[tokio::test]
    async fn test_dispatches_reserved_methods() {
        let parent = connect(Arc::new(ChildDispatcher::new(Arc::new(EchoModule))));

        assert_eq!(parent.call(PING_METHOD, vec![]).await.unwrap(), Value::from("pong"));
        assert_eq!(
            parent.call(RUN_METHOD, vec![Value::from(5)]).await.unwrap(),
            Value::from(5)
        );

        let err = parent.call("nope", vec![]).await.unwrap_err();
        assert!(matches!(err, FarmError::CallFailure(_)));
    }

    #[tokio::test]
    async fn test_init_records_generation() {
        let dispatcher = Arc::new(ChildDispatcher::new(Arc::new(InitModule::default())));
        let parent = connect(dispatcher.clone());

        let ack = parent
            .call(INIT_METHOD, vec![serde_json::json!({"key": 7}), Value::from(3)])
            .await
            .unwrap();
        assert_eq!(ack, Value::from(3));
        assert_eq!(dispatcher.generation(), 3);

        let seen = parent.call(RUN_METHOD, vec![]).await.unwrap();
        assert_eq!(seen, serde_json::json!({"key": 7}));
    }
}
