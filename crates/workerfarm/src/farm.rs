//! The scheduler: owns the pool, routes calls, propagates configuration
//! and replaces workers that die.
//!
//! Routing starts on the in-process worker (when enabled) while child
//! processes spawn in the background, and moves to the pool once enough
//! of it is ready. Among ready pool members the least loaded one wins,
//! ties going to the lowest worker id.

use crate::{FarmConfig, MainHandlers, Worker, WorkerInfo};
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, error, info, warn};
use workerfarm_core::{FarmError, Generation, IdAllocator, LogBus, Result, WorkerId};
use workerfarm_worker::ModuleRegistry;

/// Time a child gets to exit after its channel closes during `end`
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Pause between attempts to start a worker
const RESPAWN_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration shared with every worker. Held for writing only by
/// `init`, and for reading while a call is enqueued or a new worker is
/// initialized.
struct FarmState {
    options: Value,
    generation: Generation,
}

struct FarmInner {
    config: FarmConfig,
    target: usize,
    threshold: AtomicUsize,

    handlers: MainHandlers,
    bus: LogBus,
    call_ids: IdAllocator,
    worker_ids: IdAllocator,

    state: RwLock<FarmState>,
    generation: AtomicU64,

    local: Option<Arc<Worker>>,
    /// Why the in-process worker is behind the current generation
    local_failure: Mutex<Option<FarmError>>,
    pool: Mutex<BTreeMap<WorkerId, Arc<Worker>>>,
    settled: Arc<Notify>,

    use_remote: AtomicBool,
    ready_remote: AtomicUsize,
    warmed_tx: watch::Sender<bool>,

    respawns: AtomicUsize,
    fatal: Mutex<Option<FarmError>>,
    ending: AtomicBool,
    ended: tokio::sync::Mutex<bool>,
}

pub struct FarmBuilder {
    config: FarmConfig,
    options: Value,
    modules: Option<ModuleRegistry>,
    handlers: Option<MainHandlers>,
    log_bus: Option<LogBus>,
}

impl FarmBuilder {
    pub fn new(config: FarmConfig) -> Self {
        FarmBuilder {
            config,
            options: Value::Null,
            modules: None,
            handlers: None,
            log_bus: None,
        }
    }

    /// Initial options, delivered to every worker as generation 0
    pub fn options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Modules available to the in-process worker
    pub fn modules(mut self, modules: ModuleRegistry) -> Self {
        self.modules = Some(modules);
        self
    }

    pub fn handlers(mut self, handlers: MainHandlers) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn log_bus(mut self, bus: LogBus) -> Self {
        self.log_bus = Some(bus);
        self
    }

    /// Initialize the in-process worker and start provisioning the pool.
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<WorkerFarm> {
        let config = self.config;
        config.validate()?;

        let handlers = self.handlers.unwrap_or_else(MainHandlers::with_defaults);
        let bus = self.log_bus.unwrap_or_default();
        let modules = self.modules.unwrap_or_else(ModuleRegistry::with_builtins);
        let worker_ids = IdAllocator::new();
        let settled = Arc::new(Notify::new());

        let local = if config.use_local_worker {
            let module = modules.get(&config.worker.module).ok_or_else(|| {
                FarmError::Config(format!(
                    "no task module named `{}` for the local worker",
                    config.worker.module
                ))
            })?;
            let worker = Worker::local(
                worker_ids.next_worker(),
                module,
                handlers.clone(),
                bus.clone(),
                settled.clone(),
            );
            worker.reinit(self.options.clone(), 0).await?;
            worker.mark_ready();
            Some(worker)
        } else {
            None
        };

        let target = config.target_pool_size();
        let threshold = config.switch_threshold(target);
        let (warmed_tx, _) = watch::channel(target == 0);

        let inner = Arc::new(FarmInner {
            target,
            threshold: AtomicUsize::new(threshold),
            handlers,
            bus,
            call_ids: IdAllocator::new(),
            worker_ids,
            state: RwLock::new(FarmState {
                options: self.options,
                generation: 0,
            }),
            generation: AtomicU64::new(0),
            use_remote: AtomicBool::new(local.is_none()),
            local,
            local_failure: Mutex::new(None),
            pool: Mutex::new(BTreeMap::new()),
            settled,
            ready_remote: AtomicUsize::new(0),
            warmed_tx,
            respawns: AtomicUsize::new(0),
            fatal: Mutex::new(None),
            ending: AtomicBool::new(false),
            ended: tokio::sync::Mutex::new(false),
            config,
        });

        info!(
            pool = target,
            threshold,
            local = inner.local.is_some(),
            module = %inner.config.worker.module,
            "Starting worker farm"
        );

        for _ in 0..target {
            tokio::spawn(launch(Arc::downgrade(&inner)));
        }

        Ok(WorkerFarm { inner })
    }
}

/// Handle to a farm; clones share the same pool
#[derive(Clone)]
pub struct WorkerFarm {
    inner: Arc<FarmInner>,
}

enum Route {
    Worker(Arc<Worker>),
    Wait,
    Fail(FarmError),
}

impl WorkerFarm {
    pub async fn new(config: FarmConfig, options: Value) -> Result<Self> {
        FarmBuilder::new(config).options(options).build().await
    }

    pub fn builder(config: FarmConfig) -> FarmBuilder {
        FarmBuilder::new(config)
    }

    /// Run one call on some worker
    pub async fn run(&self, args: Vec<Value>) -> Result<Value> {
        let inner = &self.inner;

        let (worker, call): (Arc<Worker>, BoxFuture<'static, Result<Value>>) = loop {
            let notified = inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.ending.load(Ordering::SeqCst) {
                return Err(FarmError::ShuttingDown);
            }
            if let Some(fatal) = inner.fatal.lock().clone() {
                return Err(fatal);
            }

            {
                let state = inner.state.read().await;
                match inner.route(state.generation) {
                    Route::Worker(worker) => {
                        let call = worker.dispatch(args);
                        break (worker, call);
                    }
                    Route::Fail(err) => return Err(err),
                    Route::Wait => {}
                }
            }
            notified.await;
        };

        let outcome = call.await;
        if outcome.is_ok() && worker.is_remote() && !inner.config.warm_workers {
            inner.note_warm(&worker);
        }
        outcome
    }

    /// [`run`](Self::run) with typed arguments and result. A sequence
    /// (tuple, array) becomes the argument list; anything else is passed
    /// as the single argument.
    pub async fn run_as<A, R>(&self, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args) {
            Ok(Value::Array(items)) => items,
            Ok(other) => vec![other],
            Err(e) => return Err(FarmError::SerializationFailure(e.to_string())),
        };
        let result = self.run(args).await?;
        serde_json::from_value(result).map_err(|e| FarmError::SerializationFailure(e.to_string()))
    }

    /// Replace the options on every live worker. Resolves once all of
    /// them acknowledged; concurrent calls queue behind each other.
    pub async fn init(&self, options: Value) -> Result<()> {
        let inner = &self.inner;
        if inner.ending.load(Ordering::SeqCst) {
            return Err(FarmError::ShuttingDown);
        }
        if let Some(fatal) = inner.fatal.lock().clone() {
            return Err(fatal);
        }

        let mut state = inner.state.write().await;
        let generation = state.generation + 1;
        state.generation = generation;
        state.options = options.clone();
        inner.generation.store(generation, Ordering::Release);

        let mut targets: Vec<Arc<Worker>> = inner.local.iter().cloned().collect();
        targets.extend(inner.pool.lock().values().filter(|w| w.is_ready()).cloned());

        debug!(generation, workers = targets.len(), "Re-initializing workers");

        let results = join_all(
            targets
                .iter()
                .map(|worker| worker.reinit(options.clone(), generation)),
        )
        .await;

        let mut first_failure = None;
        for (worker, result) in targets.iter().zip(results) {
            let err = match result {
                Ok(()) => {
                    if !worker.is_remote() {
                        *inner.local_failure.lock() = None;
                    }
                    continue;
                }
                Err(err) => err,
            };

            // A worker lost mid-broadcast is no longer live; its
            // replacement starts on the new options
            if err.is_worker_loss() {
                debug!(worker = %worker.id(), generation, "Worker lost during re-init");
                continue;
            }
            warn!(worker = %worker.id(), generation, "Re-init failed: {}", err);

            if worker.is_remote() {
                if worker.is_alive() {
                    inner.retire(worker);
                }
            } else {
                *inner.local_failure.lock() = Some(err.clone());
            }
            first_failure.get_or_insert(err);
        }
        drop(state);

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// True once routing moved from the in-process worker to the pool
    pub fn should_use_remote_workers(&self) -> bool {
        self.inner.use_remote.load(Ordering::Acquire)
    }

    /// Live child-process workers, starting ones included
    pub fn pool_size(&self) -> usize {
        self.inner
            .pool
            .lock()
            .values()
            .filter(|w| w.is_alive())
            .count()
    }

    pub fn generation(&self) -> Generation {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Snapshot of every worker, the in-process one first
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.inner.local.iter().map(|w| w.info()).collect();
        infos.extend(self.inner.pool.lock().values().map(|w| w.info()));
        infos
    }

    pub fn log_bus(&self) -> &LogBus {
        &self.inner.bus
    }

    pub fn handlers(&self) -> &MainHandlers {
        &self.inner.handlers
    }

    /// Resolves once the initially provisioned workers are all warm
    pub async fn warmed_up(&self) {
        let mut rx = self.inner.warmed_tx.subscribe();
        let _ = rx.wait_for(|warm| *warm).await;
    }

    pub fn is_warmed_up(&self) -> bool {
        *self.inner.warmed_tx.borrow()
    }

    /// Stop accepting calls, let in-flight calls settle within the grace
    /// period, then stop every worker. Later calls return immediately.
    pub async fn end(&self) {
        let inner = &self.inner;
        let mut ended = inner.ended.lock().await;
        if *ended {
            return;
        }

        inner.ending.store(true, Ordering::SeqCst);
        inner.settled.notify_waiters();
        info!("Shutting down worker farm");

        let deadline = tokio::time::Instant::now() + inner.config.shutdown_grace();
        let mut drained = true;
        loop {
            let notified = inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let in_flight = inner.total_in_flight();
            if in_flight == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(in_flight, "Grace period elapsed with calls still running");
                drained = false;
                break;
            }
        }

        let workers: Vec<Arc<Worker>> = inner.pool.lock().values().cloned().collect();
        if !drained {
            for worker in workers.iter().chain(inner.local.iter()) {
                if worker.in_flight() > 0 {
                    worker.terminate();
                }
            }
        }
        join_all(workers.iter().map(|w| w.shutdown(EXIT_WAIT))).await;
        inner.pool.lock().clear();
        if let Some(local) = &inner.local {
            local.terminate();
        }

        *ended = true;
        info!("Worker farm stopped");
    }
}

impl FarmInner {
    /// Pick a worker on `generation`. A worker behind it is never chosen.
    fn route(&self, generation: Generation) -> Route {
        let local = self.local.as_ref().filter(|w| w.is_alive());
        let current_local = local.filter(|w| w.generation() == generation);

        if !self.use_remote.load(Ordering::Acquire) {
            if let Some(local) = current_local {
                return Route::Worker(local.clone());
            }
        }

        let cap = self.config.max_concurrent_calls_per_worker;
        let pool = self.pool.lock();
        let mut any_alive = false;
        let mut any_ready = false;
        let mut best: Option<&Arc<Worker>> = None;

        for worker in pool.values() {
            any_alive |= worker.is_alive();
            if !worker.is_ready() || worker.generation() != generation {
                continue;
            }
            any_ready = true;
            let load = worker.in_flight();
            if load >= cap {
                continue;
            }
            if best.map_or(true, |b| load < b.in_flight()) {
                best = Some(worker);
            }
        }

        match (best, current_local, local) {
            (Some(worker), _, _) => Route::Worker(worker.clone()),
            (None, _, _) if any_ready => Route::Wait,
            (None, Some(local), _) => Route::Worker(local.clone()),
            // Stale in-process worker and no child coming up to replace it
            (None, None, Some(local)) if !any_alive => {
                let failure = self.local_failure.lock().clone();
                Route::Fail(failure.unwrap_or_else(|| FarmError::InitFailure {
                    worker: local.id(),
                    message: format!("worker is behind generation {}", generation),
                }))
            }
            (None, _, _) => Route::Wait,
        }
    }

    fn total_in_flight(&self) -> usize {
        let local = self.local.as_ref().map_or(0, |w| w.in_flight());
        local + self.pool.lock().values().map(|w| w.in_flight()).sum::<usize>()
    }

    /// Spawn a child and bring it to the current generation
    async fn start_worker(&self) -> Result<Arc<Worker>> {
        let worker = Worker::spawn(
            self.worker_ids.next_worker(),
            &self.config.worker,
            self.call_ids.clone(),
            self.handlers.clone(),
            self.bus.clone(),
            self.settled.clone(),
        )?;
        self.pool.lock().insert(worker.id(), worker.clone());

        // Holding the read lock keeps `init` from running a broadcast this
        // worker would miss
        let initialized = {
            let state = self.state.read().await;
            if self.ending.load(Ordering::SeqCst) {
                Err(FarmError::ShuttingDown)
            } else {
                worker
                    .reinit(state.options.clone(), state.generation)
                    .await
                    .map(|()| {
                        worker.mark_ready();
                    })
            }
        };

        if let Err(err) = initialized {
            self.pool.lock().remove(&worker.id());
            worker.terminate();
            return Err(err);
        }
        self.settled.notify_waiters();

        if self.config.warm_workers {
            match worker.ping().await {
                Ok(()) => {
                    self.note_warm(&worker);
                    self.note_ready();
                }
                Err(e) => warn!(worker = %worker.id(), "Warm-up ping failed: {}", e),
            }
        } else {
            self.note_ready();
        }

        Ok(worker)
    }

    fn note_ready(&self) {
        self.ready_remote.fetch_add(1, Ordering::AcqRel);
        self.check_switch();
    }

    fn check_switch(&self) {
        if self.use_remote.load(Ordering::Acquire) {
            return;
        }
        let needed = self.threshold.load(Ordering::Acquire);
        if self.ready_remote.load(Ordering::Acquire) >= needed {
            info!(ready = needed, "Routing calls to remote workers");
            self.use_remote.store(true, Ordering::Release);
            self.settled.notify_waiters();
        }
    }

    /// Fires the warm-up signal once `target` live workers are warm
    fn note_warm(&self, worker: &Worker) {
        if !worker.mark_warm() || *self.warmed_tx.borrow() {
            return;
        }
        let warm = self
            .pool
            .lock()
            .values()
            .filter(|w| w.is_alive() && w.is_warm())
            .count();
        if warm >= self.target && !self.warmed_tx.send_replace(true) {
            info!(workers = warm, "Worker pool warmed up");
        }
    }

    fn take_respawn(&self) -> bool {
        let max = self.config.max_respawns;
        self.respawns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Stop routing to `worker` and start a replacement if the budget allows
    fn retire(self: &Arc<Self>, worker: &Arc<Worker>) {
        self.pool.lock().remove(&worker.id());
        worker.terminate();
        self.replace(worker.id(), FarmError::WorkerTerminated { worker: worker.id() });
    }

    fn replace(self: &Arc<Self>, lost: WorkerId, cause: FarmError) {
        if self.ending.load(Ordering::SeqCst) {
            return;
        }
        if self.take_respawn() {
            debug!(worker = %lost, "Spawning replacement worker");
            tokio::spawn(launch(Arc::downgrade(self)));
        } else {
            self.give_up(cause);
        }
    }

    /// Out of respawns. Fatal once no child process is left.
    fn give_up(&self, cause: FarmError) {
        let alive = self.pool.lock().values().filter(|w| w.is_alive()).count();
        if alive > 0 {
            warn!(alive, "Respawn budget exhausted: {}", cause);
            // The pool will not grow back, so stop waiting for the rest of it
            self.threshold.fetch_min(alive, Ordering::AcqRel);
            self.check_switch();
            return;
        }

        error!("Worker pool failed permanently: {}", cause);
        *self.fatal.lock() = Some(FarmError::PersistentFailure(cause.to_string()));
        self.settled.notify_waiters();
    }

    fn on_worker_closed(self: &Arc<Self>, worker: &Arc<Worker>) {
        let previous = worker.mark_dead();
        worker.terminate();
        self.pool.lock().remove(&worker.id());

        if self.ending.load(Ordering::SeqCst)
            || matches!(previous, crate::WorkerState::Stopping | crate::WorkerState::Dead)
        {
            return;
        }

        warn!(worker = %worker.id(), "Worker died unexpectedly");
        self.replace(worker.id(), FarmError::WorkerDied { worker: worker.id() });
    }
}

impl Drop for FarmInner {
    fn drop(&mut self) {
        for worker in self.pool.get_mut().values() {
            worker.terminate();
        }
    }
}

/// Start one pool slot, retrying within the respawn budget
async fn launch(farm: Weak<FarmInner>) {
    loop {
        let Some(inner) = farm.upgrade() else { return };
        if inner.ending.load(Ordering::SeqCst) {
            return;
        }

        match inner.start_worker().await {
            Ok(worker) => {
                tokio::spawn(monitor(farm, worker));
                return;
            }
            Err(FarmError::ShuttingDown) => return,
            Err(err) => {
                warn!("Failed to start worker: {}", err);
                if !inner.take_respawn() {
                    inner.give_up(err);
                    return;
                }
            }
        }

        drop(inner);
        tokio::time::sleep(RESPAWN_BACKOFF).await;
    }
}

/// Wait for a worker's connection to drop and handle the loss
async fn monitor(farm: Weak<FarmInner>, worker: Arc<Worker>) {
    worker.closed().await;
    if let Some(inner) = farm.upgrade() {
        inner.on_worker_closed(&worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_only(module: &str) -> FarmConfig {
        FarmConfig {
            max_workers: Some(0),
            ..FarmConfig::for_module("farm-worker", module)
        }
    }

    #[tokio::test]
    async fn test_local_only_farm() {
        let farm = WorkerFarm::new(local_only("echo"), Value::Null).await.unwrap();

        assert!(farm.is_warmed_up());
        assert_eq!(farm.pool_size(), 0);
        assert!(!farm.should_use_remote_workers());
        assert_eq!(farm.run(vec![json!(42)]).await.unwrap(), json!(42));

        let echoed: Vec<String> = farm.run_as((vec!["a", "b"],)).await.unwrap();
        assert_eq!(echoed, vec!["a".to_string(), "b".to_string()]);

        farm.end().await;
    }

    #[tokio::test]
    async fn test_local_init_is_serialized() {
        let farm = WorkerFarm::new(local_only("init"), json!({"key": 0})).await.unwrap();
        assert_eq!(farm.run(vec![]).await.unwrap(), json!({"key": 0}));

        let (a, b) = tokio::join!(farm.init(json!({"key": 1})), farm.init(json!({"key": 2})));
        a.unwrap();
        b.unwrap();
        assert_eq!(farm.generation(), 2);

        let latest = farm.run(vec![]).await.unwrap();
        assert!(latest == json!({"key": 1}) || latest == json!({"key": 2}));

        farm.init(json!({"key": 3})).await.unwrap();
        assert_eq!(farm.run(vec![]).await.unwrap(), json!({"key": 3}));
        farm.end().await;
    }

    #[tokio::test]
    async fn test_local_nested_call_uses_main_handlers() {
        let handlers = MainHandlers::with_defaults();
        handlers.register_fn("sum", |args| {
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        });
        let farm = WorkerFarm::builder(local_only("ipc"))
            .handlers(handlers)
            .build()
            .await
            .unwrap();

        assert_eq!(farm.run(vec![json!(1), json!(2)]).await.unwrap(), json!(3));
        farm.end().await;
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_rejects_new_calls() {
        let farm = WorkerFarm::new(local_only("sleep"), Value::Null).await.unwrap();

        let slow = {
            let farm = farm.clone();
            tokio::spawn(async move { farm.run(vec![json!(50), json!("done")]).await })
        };
        while farm.workers()[0].in_flight == 0 {
            tokio::task::yield_now().await;
        }

        tokio::join!(farm.end(), farm.end());
        farm.end().await;

        assert_eq!(slow.await.unwrap().unwrap(), json!("done"));
        assert_eq!(farm.run(vec![]).await.unwrap_err(), FarmError::ShuttingDown);
        assert_eq!(farm.init(Value::Null).await.unwrap_err(), FarmError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_end_rejects_local_calls_after_grace() {
        let config = FarmConfig {
            shutdown_grace_ms: 50,
            ..local_only("sleep")
        };
        let farm = WorkerFarm::new(config, Value::Null).await.unwrap();
        let local = farm.workers()[0].id;

        let slow = {
            let farm = farm.clone();
            tokio::spawn(async move { farm.run(vec![json!(5_000), json!("done")]).await })
        };
        while farm.workers()[0].in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        farm.end().await;
        let err = slow.await.unwrap().unwrap_err();
        assert_eq!(err, FarmError::WorkerTerminated { worker: local });
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_failed_local_init_is_not_served() {
        let farm = WorkerFarm::new(local_only("init"), json!({"key": 0})).await.unwrap();
        assert_eq!(farm.run(vec![]).await.unwrap(), json!({"key": 0}));

        let err = farm.init(json!({"key": 1, "reject": true})).await.unwrap_err();
        assert!(matches!(err, FarmError::InitFailure { .. }));
        assert_eq!(farm.generation(), 1);
        assert_eq!(farm.workers()[0].generation, 0);

        // The old options are never served under the new generation
        assert_eq!(farm.run(vec![]).await.unwrap_err(), err);

        farm.init(json!({"key": 2})).await.unwrap();
        assert_eq!(farm.workers()[0].generation, 2);
        assert_eq!(farm.run(vec![]).await.unwrap(), json!({"key": 2}));
        farm.end().await;
    }

    #[tokio::test]
    async fn test_unknown_local_module_is_config_error() {
        let result = WorkerFarm::new(local_only("no-such-module"), Value::Null).await;
        assert!(matches!(result, Err(FarmError::Config(_))));
    }

    #[tokio::test]
    async fn test_spawn_failures_become_persistent() {
        let config = FarmConfig {
            use_local_worker: false,
            max_workers: Some(1),
            max_respawns: 2,
            ..FarmConfig::for_module("/nonexistent/farm-worker", "echo")
        };
        let farm = WorkerFarm::new(config, Value::Null).await.unwrap();
        assert!(farm.should_use_remote_workers());

        let err = farm.run(vec![json!(1)]).await.unwrap_err();
        assert!(matches!(err, FarmError::PersistentFailure(_)));
        farm.end().await;
    }
}
