pub mod config;
pub mod farm;
pub mod handlers;
pub mod local;
pub mod output;
pub mod spawn;
pub mod worker;

pub use config::{FarmConfig, WorkerSpec};
pub use farm::{FarmBuilder, WorkerFarm};
pub use handlers::{MainHandler, MainHandlers, ProcessIdHandler};
pub use local::LocalLink;
pub use output::{classify_line, OutputRouter};
pub use worker::{ExecutionMode, Worker, WorkerInfo, WorkerState};

pub use workerfarm_core::{FarmError, LogBus, LogEvent, LogLevel, LogSource, Result, Subscription};
pub use workerfarm_worker::{ModuleRegistry, TaskModule, TaskResult, WorkerContext};
