//! One pool member: a child process behind a [`Bridge`], or the task
//! module running inline in this process. Both follow the same state
//! machine:
//!
//! `Starting -> Idle <-> Busy -> Stopping -> Dead`

use crate::spawn::{spawn_child, SpawnedChild};
use crate::{LocalLink, MainHandlers, OutputRouter, WorkerSpec};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use workerfarm_core::{FarmError, Generation, IdAllocator, LogBus, Result, StdStream, WorkerId};
use workerfarm_protocol::{Bridge, Channel, INIT_METHOD, PING_METHOD, RUN_METHOD};
use workerfarm_worker::{TaskModule, WorkerContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    InProcess,
    ChildProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Stopping,
    Dead,
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub mode: ExecutionMode,
    pub state: WorkerState,
    pub in_flight: usize,
    pub generation: Generation,
    pub calls_served: u64,
    pub pid: Option<u32>,
}

struct ChildBackend {
    bridge: Bridge,
    pid: Option<u32>,
    kill: Arc<Notify>,
    exited: watch::Receiver<bool>,
}

enum Backend {
    InProcess {
        module: Arc<dyn TaskModule>,
        ctx: WorkerContext,
        terminated: watch::Sender<bool>,
    },
    ChildProcess(ChildBackend),
}

pub struct Worker {
    id: WorkerId,
    backend: Backend,
    state: Mutex<WorkerState>,
    in_flight: AtomicUsize,
    generation: AtomicU64,
    served: AtomicU64,
    warm: AtomicBool,
    settled: Arc<Notify>,
}

impl Worker {
    /// Worker that runs `module` inline. It starts idle once initialized.
    pub fn local(
        id: WorkerId,
        module: Arc<dyn TaskModule>,
        handlers: MainHandlers,
        bus: LogBus,
        settled: Arc<Notify>,
    ) -> Arc<Self> {
        let router = Arc::new(OutputRouter::new(bus, id));
        let ctx = WorkerContext::new(Arc::new(LocalLink::new(handlers, router)));
        let (terminated, _) = watch::channel(false);

        Arc::new(Worker::with_backend(
            id,
            Backend::InProcess {
                module,
                ctx,
                terminated,
            },
            settled,
        ))
    }

    /// Start a child process and bind a bridge to its stdio
    pub fn spawn(
        id: WorkerId,
        spec: &WorkerSpec,
        ids: IdAllocator,
        handlers: MainHandlers,
        bus: LogBus,
        settled: Arc<Notify>,
    ) -> Result<Arc<Self>> {
        let SpawnedChild {
            child,
            pid,
            stdin,
            stdout,
            stderr,
        } = spawn_child(spec)?;

        let router = Arc::new(OutputRouter::new(bus, id));
        let bridge = Bridge::spawn(
            Channel::new(stdout, stdin),
            Arc::new(handlers),
            router.clone(),
            ids,
            FarmError::WorkerDied { worker: id },
        );

        let stderr_router = router.clone();
        tokio::spawn(async move {
            stderr_router.forward_raw(StdStream::Stderr, stderr).await;
        });

        let kill = Arc::new(Notify::new());
        let (exited_tx, exited) = watch::channel(false);
        tokio::spawn(reap(id, child, kill.clone(), exited_tx, bridge.clone(), router));

        info!(worker = %id, pid, "Worker process started");

        Ok(Arc::new(Worker::with_backend(
            id,
            Backend::ChildProcess(ChildBackend {
                bridge,
                pid,
                kill,
                exited,
            }),
            settled,
        )))
    }

    fn with_backend(id: WorkerId, backend: Backend, settled: Arc<Notify>) -> Self {
        Worker {
            id,
            backend,
            state: Mutex::new(WorkerState::Starting),
            in_flight: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            served: AtomicU64::new(0),
            warm: AtomicBool::new(false),
            settled,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.backend {
            Backend::InProcess { .. } => ExecutionMode::InProcess,
            Backend::ChildProcess(_) => ExecutionMode::ChildProcess,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.mode() == ExecutionMode::ChildProcess
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Initialized and accepting calls
    pub fn is_ready(&self) -> bool {
        let connected = match &self.backend {
            Backend::ChildProcess(child) => !child.bridge.is_closed(),
            Backend::InProcess { .. } => true,
        };
        connected && matches!(self.state(), WorkerState::Idle | WorkerState::Busy)
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), WorkerState::Stopping | WorkerState::Dead)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::Acquire)
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            mode: self.mode(),
            state: self.state(),
            in_flight: self.in_flight(),
            generation: self.generation(),
            calls_served: self.served.load(Ordering::Relaxed),
            pid: match &self.backend {
                Backend::ChildProcess(child) => child.pid,
                Backend::InProcess { .. } => Some(std::process::id()),
            },
        }
    }

    /// `Starting -> Idle`. False if the worker already left `Starting`.
    pub fn mark_ready(&self) -> bool {
        let mut state = self.state.lock();
        if *state != WorkerState::Starting {
            return false;
        }
        *state = WorkerState::Idle;
        true
    }

    /// Record the first successful call or ping. True only the first time.
    pub fn mark_warm(&self) -> bool {
        !self.warm.swap(true, Ordering::AcqRel)
    }

    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    /// Move to `Dead`, returning the state the worker was in
    pub fn mark_dead(&self) -> WorkerState {
        let mut state = self.state.lock();
        std::mem::replace(&mut *state, WorkerState::Dead)
    }

    /// Run one call. The returned future owns everything it needs, so
    /// the caller may drop any locks before awaiting it; for a child
    /// process the call frame is already queued when this returns.
    pub fn dispatch(self: &Arc<Self>, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        let guard = InFlight::enter(self.clone());

        match &self.backend {
            Backend::ChildProcess(child) => {
                let pending = child.bridge.start_call(RUN_METHOD, args);
                async move {
                    let outcome = pending.wait().await;
                    drop(guard);
                    outcome
                }
                .boxed()
            }
            Backend::InProcess {
                module,
                ctx,
                terminated,
            } => {
                let module = module.clone();
                let ctx = ctx.clone();
                let mut terminated = terminated.subscribe();
                let worker = self.id;
                async move {
                    let cancelled = async move {
                        let _ = terminated.wait_for(|done| *done).await;
                    };
                    let run = AssertUnwindSafe(module.run(&ctx, args)).catch_unwind();

                    // A terminated worker drops the task future unfinished
                    let outcome = tokio::select! {
                        biased;
                        _ = cancelled => Err(FarmError::WorkerTerminated { worker }),
                        outcome = run => match outcome {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(message)) => Err(FarmError::CallFailure(message)),
                            Err(_) => Err(FarmError::CallFailure("task module panicked".into())),
                        },
                    };
                    drop(guard);
                    outcome
                }
                .boxed()
            }
        }
    }

    /// Apply new options. The stored generation changes only after the
    /// worker acknowledged them.
    pub async fn reinit(&self, options: Value, generation: Generation) -> Result<()> {
        let outcome = match &self.backend {
            Backend::InProcess { module, .. } => module.init(options).await,
            Backend::ChildProcess(child) => {
                let reply = child
                    .bridge
                    .call(INIT_METHOD, vec![options, Value::from(generation)])
                    .await;
                match reply {
                    Ok(_) => Ok(()),
                    // Not the options' fault; the monitor replaces the worker
                    Err(e) if e.is_worker_loss() => return Err(e),
                    Err(FarmError::Protocol(message)) => Err(message
                        .strip_prefix("init rejected: ")
                        .map(str::to_string)
                        .unwrap_or(message)),
                    Err(other) => Err(other.to_string()),
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.generation.store(generation, Ordering::Release);
                debug!(worker = %self.id, generation, "Worker initialized");
                Ok(())
            }
            Err(message) => Err(FarmError::InitFailure {
                worker: self.id,
                message,
            }),
        }
    }

    /// Round trip without running task code
    pub async fn ping(&self) -> Result<()> {
        match &self.backend {
            Backend::InProcess { .. } => Ok(()),
            Backend::ChildProcess(child) => {
                let reply = child.bridge.call(PING_METHOD, vec![]).await?;
                if reply.as_str() == Some("pong") {
                    Ok(())
                } else {
                    Err(FarmError::Protocol(format!("unexpected ping reply: {}", reply)))
                }
            }
        }
    }

    /// Resolves once the worker's connection is gone. Never resolves for
    /// an in-process worker.
    pub async fn closed(&self) {
        match &self.backend {
            Backend::ChildProcess(child) => child.bridge.closed().await,
            Backend::InProcess { .. } => futures::future::pending().await,
        }
    }

    /// Kill the worker now, rejecting its pending calls
    pub fn terminate(&self) {
        let previous = self.mark_dead();
        match &self.backend {
            Backend::ChildProcess(child) => {
                child.bridge.close(FarmError::WorkerTerminated { worker: self.id });
                child.kill.notify_one();
            }
            Backend::InProcess { terminated, .. } => {
                terminated.send_replace(true);
            }
        }
        if previous != WorkerState::Dead {
            debug!(worker = %self.id, "Worker terminated");
        }
        self.settled.notify_waiters();
    }

    /// Close the channel so the child exits on its own, killing it if it
    /// has not exited within `wait`.
    pub async fn shutdown(&self, wait: Duration) {
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Dead {
                return;
            }
            *state = WorkerState::Stopping;
        }

        if let Backend::ChildProcess(child) = &self.backend {
            child.bridge.close_outgoing();
            let mut exited = child.exited.clone();
            let exit = async move {
                let _ = exited.wait_for(|done| *done).await;
            };
            if tokio::time::timeout(wait, exit).await.is_err() {
                warn!(worker = %self.id, "Worker did not exit in time, killing it");
            }
        }
        self.terminate();
    }
}

/// Counts one call against a worker for as long as it lives
struct InFlight(Arc<Worker>);

impl InFlight {
    fn enter(worker: Arc<Worker>) -> Self {
        {
            let mut state = worker.state.lock();
            worker.in_flight.fetch_add(1, Ordering::AcqRel);
            if *state == WorkerState::Idle {
                *state = WorkerState::Busy;
            }
        }
        InFlight(worker)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let worker = &self.0;
        {
            let mut state = worker.state.lock();
            let previous = worker.in_flight.fetch_sub(1, Ordering::AcqRel);
            if previous == 1 && *state == WorkerState::Busy {
                *state = WorkerState::Idle;
            }
        }
        worker.served.fetch_add(1, Ordering::Relaxed);
        worker.settled.notify_waiters();
    }
}

/// Owns the child: waits for it to exit (or kills it on request), then
/// closes its bridge.
async fn reap(
    worker: WorkerId,
    mut child: Child,
    kill: Arc<Notify>,
    exited: watch::Sender<bool>,
    bridge: Bridge,
    router: Arc<OutputRouter>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.notified() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    match status {
        Ok(status) => debug!(worker = %worker, %status, "Worker process exited"),
        Err(e) => warn!(worker = %worker, "Failed to wait for worker process: {}", e),
    }

    bridge.close(FarmError::WorkerDied { worker });
    router.flush();
    exited.send_replace(true);
}
