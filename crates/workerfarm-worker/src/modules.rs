//! Built-in task modules, hosted by the `farm-worker` binary.

use crate::{ModuleRegistry, TaskModule, TaskResult, WorkerContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::time::Duration;

/// Returns its first argument unchanged
pub struct EchoModule;

#[async_trait]
impl TaskModule for EchoModule {
    async fn run(&self, _ctx: &WorkerContext, args: Vec<Value>) -> TaskResult {
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    }
}

pub struct PingModule;

#[async_trait]
impl TaskModule for PingModule {
    async fn run(&self, _ctx: &WorkerContext, _args: Vec<Value>) -> TaskResult {
        Ok(Value::from("pong"))
    }
}

/// Returns the options it was last initialized with.
///
/// Options with `"reject": true`, or a `"reject_pid"` equal to this
/// process id, are refused and the previous options stay in place.
#[derive(Default)]
pub struct InitModule {
    options: RwLock<Value>,
}

#[async_trait]
impl TaskModule for InitModule {
    async fn init(&self, options: Value) -> TaskResult<()> {
        let rejected = options["reject"].as_bool() == Some(true)
            || options["reject_pid"].as_u64() == Some(u64::from(std::process::id()));
        if rejected {
            return Err(format!("options refused by process {}", std::process::id()));
        }
        *self.options.write() = options;
        Ok(())
    }

    async fn run(&self, _ctx: &WorkerContext, _args: Vec<Value>) -> TaskResult {
        Ok(self.options.read().clone())
    }
}

/// Asks the initiating process to add its two arguments
pub struct MainSumModule;

#[async_trait]
impl TaskModule for MainSumModule {
    async fn run(&self, ctx: &WorkerContext, args: Vec<Value>) -> TaskResult {
        ctx.call_main("sum", args).await.map_err(|e| e.to_string())
    }
}

/// Returns `[own pid, initiating process pid]`
pub struct ProcessIdsModule;

#[async_trait]
impl TaskModule for ProcessIdsModule {
    async fn run(&self, ctx: &WorkerContext, _args: Vec<Value>) -> TaskResult {
        let main_pid = ctx.call_main("pid", vec![]).await.map_err(|e| e.to_string())?;
        Ok(Value::Array(vec![Value::from(std::process::id()), main_pid]))
    }
}

/// Writes five lines across stdout and stderr
pub struct StdioModule;

#[async_trait]
impl TaskModule for StdioModule {
    async fn run(&self, ctx: &WorkerContext, _args: Vec<Value>) -> TaskResult {
        // Output in the initiating process already reaches its own stdio
        if ctx.is_worker() {
            ctx.println("one");
            ctx.stdout("two\n");
            ctx.eprintln("three");
            ctx.eprintln("four");
            ctx.stderr("five\n");
        }
        Ok(Value::Null)
    }
}

/// Emits structured log records
pub struct LoggingModule;

#[async_trait]
impl TaskModule for LoggingModule {
    async fn run(&self, ctx: &WorkerContext, _args: Vec<Value>) -> TaskResult {
        ctx.info("omg it works");
        ctx.error("errors objects dont work yet");
        Ok(Value::Null)
    }
}

/// Always fails with its first argument as the message
pub struct FailModule;

#[async_trait]
impl TaskModule for FailModule {
    async fn run(&self, _ctx: &WorkerContext, args: Vec<Value>) -> TaskResult {
        let reason = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("no reason given");
        Err(format!("task failed: {}", reason))
    }
}

/// Sleeps `args[0]` milliseconds, then returns `args[1]`
pub struct SleepModule;

#[async_trait]
impl TaskModule for SleepModule {
    async fn run(&self, _ctx: &WorkerContext, args: Vec<Value>) -> TaskResult {
        let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(args.get(1).cloned().unwrap_or(Value::Null))
    }
}

/// Exits the worker process when asked to `"crash"`, echoes otherwise
pub struct CrashModule;

#[async_trait]
impl TaskModule for CrashModule {
    async fn run(&self, ctx: &WorkerContext, args: Vec<Value>) -> TaskResult {
        let first = args.into_iter().next().unwrap_or(Value::Null);
        if first.as_str() == Some("crash") {
            if !ctx.is_worker() {
                return Err("refusing to exit the initiating process".to_string());
            }
            std::process::exit(70);
        }
        Ok(first)
    }
}

impl ModuleRegistry {
    /// Registry holding every built-in module
    pub fn with_builtins() -> Self {
        let registry = ModuleRegistry::new();
        registry.register("echo", EchoModule);
        registry.register("ping", PingModule);
        registry.register("init", InitModule::default());
        registry.register("ipc", MainSumModule);
        registry.register("ipc-pid", ProcessIdsModule);
        registry.register("stdio", StdioModule);
        registry.register("logging", LoggingModule);
        registry.register("fail", FailModule);
        registry.register("sleep", SleepModule);
        registry.register("crash", CrashModule);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_module() {
        let ctx = WorkerContext::detached();
        let payload = json!(["a", "b"]);
        let result = EchoModule.run(&ctx, vec![payload.clone()]).await.unwrap();
        assert_eq!(result, payload);
        assert_eq!(EchoModule.run(&ctx, vec![]).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_init_module_tracks_latest_options() {
        let ctx = WorkerContext::detached();
        let module = InitModule::default();
        module.init(json!({"key": 1})).await.unwrap();
        module.init(json!({"key": 2})).await.unwrap();
        assert_eq!(module.run(&ctx, vec![]).await.unwrap(), json!({"key": 2}));

        assert!(module.init(json!({"key": 3, "reject": true})).await.is_err());
        let pid = std::process::id();
        assert!(module.init(json!({"key": 4, "reject_pid": pid})).await.is_err());
        assert_eq!(module.run(&ctx, vec![]).await.unwrap(), json!({"key": 2}));
    }

    #[tokio::test]
    async fn test_fail_and_crash_in_process() {
        let ctx = WorkerContext::detached();
        let err = FailModule.run(&ctx, vec![json!("bad input")]).await.unwrap_err();
        assert_eq!(err, "task failed: bad input");

        assert!(CrashModule.run(&ctx, vec![json!("crash")]).await.is_err());
        assert_eq!(CrashModule.run(&ctx, vec![json!(4)]).await.unwrap(), json!(4));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ModuleRegistry::with_builtins();
        for name in ["echo", "ping", "init", "ipc", "ipc-pid", "stdio", "logging", "fail", "sleep", "crash"] {
            assert!(registry.has_module(name), "missing {}", name);
        }
    }
}
