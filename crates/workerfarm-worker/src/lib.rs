pub mod context;
pub mod handler;
pub mod modules;
pub mod runtime;

pub use context::{BridgeLink, MainLink, WorkerContext};
pub use handler::{ModuleRegistry, TaskModule, TaskResult};
pub use runtime::{init_child_tracing, run_worker_main, ChildDispatcher};
