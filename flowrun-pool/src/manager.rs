//! The pool manager: owns the worker set, routes executions, and runs the
//! monitoring, result-collection, and heartbeat loops.
//!
//! All worker bookkeeping lives behind a single mutex over [`PoolState`];
//! every loop and caller-facing operation works in short critical sections
//! against it, and process termination always happens outside the lock.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowrun_config::{PoolConfig, Validatable};
use flowrun_ipc::{ContextStore, ExecutionResult, FailureKind, WorkOrder, WorkerReport};
use serde_json::Value as JsonValue;

use crate::error::PoolError;
use crate::handle::{
    ExecutionDescriptor, ProcessHandle, ProcessState, ResultSink, WorkerReportMessage,
    WorkerSpawner,
};
use crate::registry::{CurrentExecution, PoolRegistry, PoolSnapshot, WorkerSnapshot};

/// Worker bookkeeping guarded by the state mutex. `spawning` counts
/// reserved-but-not-yet-inserted workers so concurrent spawns cannot push
/// the pool past its maximum size.
#[derive(Default)]
struct PoolState {
    handles: HashMap<String, ProcessHandle>,
    spawning: usize,
}

impl PoolState {
    fn live_count(&self) -> usize {
        self.handles.len() + self.spawning
    }
}

/// Everything the background loops need, shared behind an `Arc`
struct PoolShared {
    pool_id: String,
    config: PoolConfig,
    store: Arc<dyn ContextStore>,
    registry: Arc<dyn PoolRegistry>,
    spawner: Arc<dyn WorkerSpawner>,
    sink: Arc<dyn ResultSink>,
    state: Mutex<PoolState>,
    report_tx: mpsc::UnboundedSender<WorkerReportMessage>,
    idle_notify: Notify,
    next_worker: AtomicU64,
}

/// Aggregate counters for operational visibility
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub idle: usize,
    pub busy: usize,
    pub total_executions: u64,
}

/// Manages a pool of reusable worker processes and routes workflow
/// executions onto them.
///
/// A manager is single-use: once stopped it cannot be started again.
pub struct PoolManager {
    shared: Arc<PoolShared>,
    report_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerReportMessage>>>,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolManager {
    pub fn new(
        pool_id: impl Into<String>,
        config: PoolConfig,
        store: Arc<dyn ContextStore>,
        registry: Arc<dyn PoolRegistry>,
        spawner: Arc<dyn WorkerSpawner>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, PoolError> {
        config
            .validate()
            .map_err(|e| PoolError::Config(e.to_string()))?;

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            shared: Arc::new(PoolShared {
                pool_id: pool_id.into(),
                config,
                store,
                registry,
                spawner,
                sink,
                state: Mutex::new(PoolState::default()),
                report_tx,
                idle_notify: Notify::new(),
                next_worker: AtomicU64::new(0),
            }),
            report_rx: Mutex::new(Some(report_rx)),
            shutdown_tx,
            started: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn pool_id(&self) -> &str {
        &self.shared.pool_id
    }

    /// Register the pool, pre-spawn the minimum worker set, and start the
    /// monitoring, result-collection, and heartbeat loops
    pub async fn start(&self) -> Result<(), PoolError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PoolError::AlreadyStarted);
        }

        let report_rx = match self.report_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                self.started.store(false, Ordering::SeqCst);
                return Err(PoolError::AlreadyStarted);
            }
        };

        if let Err(e) = self
            .shared
            .registry
            .register(&self.shared.pool_id, self.shared.config.registration_ttl)
            .await
        {
            warn!(pool_id = %self.shared.pool_id, error = %e, "pool registration failed, continuing without registry");
        }

        for _ in 0..self.shared.config.min_workers {
            {
                self.shared.state.lock().await.spawning += 1;
            }
            if let Err(e) = spawn_reserved(&self.shared).await {
                error!(pool_id = %self.shared.pool_id, error = %e, "failed to pre-spawn minimum worker set");
                self.started.store(false, Ordering::SeqCst);
                terminate_all(&self.shared).await;
                return Err(e);
            }
        }

        let mut loops = self.loops.lock().await;

        // result-collection loop
        {
            let shared = Arc::clone(&self.shared);
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut rx = report_rx;
            loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        msg = rx.recv() => match msg {
                            Some(msg) => handle_report(&shared, msg).await,
                            None => break,
                        },
                    }
                }
            }));
        }

        // monitor loop: timeouts, crash detection, scale-down
        {
            let shared = Arc::clone(&self.shared);
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = self.shared.config.monitor_interval;
            loops.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            check_timeouts(&shared).await;
                            check_crashes(&shared).await;
                            scale_down(&shared).await;
                        }
                    }
                }
            }));
        }

        // heartbeat loop
        {
            let shared = Arc::clone(&self.shared);
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = self.shared.config.heartbeat_interval;
            loops.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => heartbeat(&shared).await,
                    }
                }
            }));
        }

        info!(
            pool_id = %self.shared.pool_id,
            min_workers = self.shared.config.min_workers,
            max_workers = self.shared.config.max_workers,
            "process pool started"
        );
        Ok(())
    }

    /// Stop the loops, terminate every worker with the configured grace
    /// period, and deregister the pool
    pub async fn stop(&self) -> Result<(), PoolError> {
        if self
            .started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PoolError::NotStarted);
        }

        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        terminate_all(&self.shared).await;

        if let Err(e) = self.shared.registry.deregister(&self.shared.pool_id).await {
            warn!(pool_id = %self.shared.pool_id, error = %e, "pool deregistration failed");
        }

        // Release any routers blocked waiting for an idle worker
        self.shared.idle_notify.notify_waiters();

        info!(pool_id = %self.shared.pool_id, "process pool stopped");
        Ok(())
    }

    /// Stage the execution context and assign the execution to an idle
    /// worker, spawning a new one if the pool is below its maximum size.
    ///
    /// Blocks while the pool is saturated. Returns once the execution has
    /// been handed to a worker; the terminal result arrives later through
    /// the pool's [`ResultSink`].
    pub async fn route_execution(
        &self,
        execution_id: &str,
        context: JsonValue,
        timeout: Option<Duration>,
    ) -> Result<(), PoolError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PoolError::NotStarted);
        }

        let timeout = timeout.unwrap_or(self.shared.config.default_timeout);
        self.shared
            .store
            .put(execution_id, context)
            .await
            .map_err(|e| {
                PoolError::Routing(format!("failed to stage context for {execution_id}: {e}"))
            })?;

        loop {
            // Register for a wakeup before inspecting state: the future
            // only joins the waiter list once enabled, and until then an
            // idle transition would coalesce into a single stored permit
            // that another router could consume
            let mut notified = std::pin::pin!(self.shared.idle_notify.notified());
            notified.as_mut().enable();

            enum Action {
                Assigned(String),
                Spawn,
                Wait,
            }

            let action = {
                let mut state = self.shared.state.lock().await;
                let idle_id = state
                    .handles
                    .values()
                    .find(|h| h.is_idle())
                    .map(|h| h.id.clone());

                if let Some(id) = idle_id {
                    let send_failed = match state.handles.get_mut(&id) {
                        Some(handle) => {
                            handle.begin_execution(ExecutionDescriptor::new(execution_id, timeout));
                            handle
                                .link
                                .send(WorkOrder::Execute {
                                    execution_id: execution_id.to_string(),
                                })
                                .await
                                .is_err()
                        }
                        None => true,
                    };
                    if send_failed {
                        warn!(worker_id = %id, execution_id = %execution_id, "idle worker unreachable, removing and retrying");
                        if let Some(mut dead) = state.handles.remove(&id) {
                            dead.state = ProcessState::Killed;
                            let grace = self.shared.config.shutdown_grace;
                            tokio::spawn(async move {
                                dead.link.terminate(grace).await;
                            });
                        }
                        continue;
                    }
                    Action::Assigned(id)
                } else if state.live_count() < self.shared.config.max_workers {
                    state.spawning += 1;
                    Action::Spawn
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Assigned(worker_id) => {
                    debug!(execution_id = %execution_id, worker_id = %worker_id, "execution assigned");
                    return Ok(());
                }
                Action::Spawn => {
                    spawn_reserved(&self.shared).await?;
                }
                Action::Wait => {
                    notified.await;
                    if !self.started.load(Ordering::SeqCst) {
                        return Err(PoolError::NotStarted);
                    }
                }
            }
        }
    }

    /// Proactively terminate one idle worker and spawn a fresh replacement.
    ///
    /// With a pid, recycles that specific process and fails if it is busy;
    /// without one, recycles the oldest idle process and fails if none is
    /// idle.
    pub async fn recycle_process(&self, pid: Option<u32>) -> Result<(), PoolError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PoolError::NotStarted);
        }

        let victim = {
            let mut state = self.shared.state.lock().await;
            let id = match pid {
                Some(p) => {
                    let found = state
                        .handles
                        .values()
                        .find(|h| h.pid() == Some(p))
                        .map(|h| (h.id.clone(), h.is_busy()));
                    match found {
                        None => return Err(PoolError::ProcessNotFound(p)),
                        Some((_, true)) => return Err(PoolError::ProcessBusy(p.to_string())),
                        Some((id, false)) => id,
                    }
                }
                None => match state
                    .handles
                    .values()
                    .filter(|h| h.is_idle())
                    .min_by_key(|h| h.spawned_at)
                    .map(|h| h.id.clone())
                {
                    Some(id) => id,
                    None => return Err(PoolError::NoIdleProcess),
                },
            };
            state.spawning += 1;
            state.handles.remove(&id).map(|mut h| {
                h.state = ProcessState::Killed;
                h
            })
        };

        if let Some(mut handle) = victim {
            info!(worker_id = %handle.id, pid = ?handle.pid(), "recycling worker");
            handle.link.terminate(self.shared.config.shutdown_grace).await;
        }
        spawn_reserved(&self.shared).await
    }

    /// Point-in-time view of the whole pool
    pub async fn snapshot(&self) -> PoolSnapshot {
        build_snapshot(&self.shared).await
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().await;
        let idle = state.handles.values().filter(|h| h.is_idle()).count();
        let busy = state.handles.values().filter(|h| h.is_busy()).count();
        let total_executions = state
            .handles
            .values()
            .map(|h| h.executions_completed)
            .sum::<u64>();
        PoolStats {
            pool_size: state.handles.len(),
            idle,
            busy,
            total_executions,
        }
    }
}

/// Spawn one worker against a previously reserved slot. Always releases
/// the reservation, whether or not the spawn succeeds.
async fn spawn_reserved(shared: &Arc<PoolShared>) -> Result<(), PoolError> {
    let n = shared.next_worker.fetch_add(1, Ordering::SeqCst);
    let worker_id = format!("worker-{n}");
    let spawned = shared.spawner.spawn(&worker_id, shared.report_tx.clone()).await;

    let mut state = shared.state.lock().await;
    state.spawning = state.spawning.saturating_sub(1);
    match spawned {
        Ok(link) => {
            debug!(worker_id = %worker_id, "worker joined pool");
            state
                .handles
                .insert(worker_id.clone(), ProcessHandle::new(worker_id, link));
            drop(state);
            shared.idle_notify.notify_one();
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Top up the pool to its minimum size after timeout or crash removals
async fn ensure_min(shared: &Arc<PoolShared>) {
    let deficit = {
        let mut state = shared.state.lock().await;
        let live = state.live_count();
        let min = shared.config.min_workers;
        let deficit = min.saturating_sub(live);
        state.spawning += deficit;
        deficit
    };
    for _ in 0..deficit {
        if let Err(e) = spawn_reserved(shared).await {
            warn!(error = %e, "failed to replace lost worker");
        }
    }
}

/// Terminate and drop every worker in the pool
async fn terminate_all(shared: &Arc<PoolShared>) {
    let handles: Vec<ProcessHandle> = {
        let mut state = shared.state.lock().await;
        state
            .handles
            .drain()
            .map(|(_, mut h)| {
                h.state = ProcessState::Killed;
                h
            })
            .collect()
    };
    for mut handle in handles {
        handle.link.terminate(shared.config.shutdown_grace).await;
    }
}

/// Drop the staged context of an execution resolved without its worker
/// ever consuming it, so the store does not accumulate orphaned entries
async fn discard_context(shared: &Arc<PoolShared>, execution_id: &str) {
    if let Err(e) = shared.store.take(execution_id).await {
        warn!(execution_id = %execution_id, error = %e, "failed to discard staged context");
    }
}

/// Kill workers whose in-flight execution has exceeded its timeout and
/// synthesize a `Timeout` result for each
async fn check_timeouts(shared: &Arc<PoolShared>) {
    let expired: Vec<(ProcessHandle, ExecutionDescriptor)> = {
        let mut state = shared.state.lock().await;
        let ids: Vec<String> = state
            .handles
            .values()
            .filter(|h| h.is_busy() && h.current.as_ref().is_some_and(|d| d.is_expired()))
            .map(|h| h.id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                state.handles.remove(&id).and_then(|mut handle| {
                    handle.state = ProcessState::Killed;
                    handle.current.take().map(|descriptor| (handle, descriptor))
                })
            })
            .collect()
    };

    for (mut handle, descriptor) in expired {
        let elapsed_ms = descriptor.elapsed().as_millis() as i64;
        warn!(
            worker_id = %handle.id,
            execution_id = %descriptor.execution_id,
            elapsed_ms,
            "execution exceeded its timeout, killing worker"
        );
        let worker_id = handle.id.clone();
        let grace = shared.config.shutdown_grace;
        // Kill in the background so a process that ignores SIGTERM does
        // not delay the other expired results or the next monitor tick
        tokio::spawn(async move {
            handle.link.terminate(grace).await;
        });
        discard_context(shared, &descriptor.execution_id).await;
        let result = ExecutionResult::failure(
            descriptor.execution_id.clone(),
            worker_id,
            FailureKind::Timeout,
            format!(
                "execution exceeded timeout of {}ms",
                descriptor.timeout.as_millis()
            ),
            elapsed_ms,
        );
        shared.sink.deliver(result).await;
        shared.idle_notify.notify_one();
    }

    ensure_min(shared).await;
}

/// Detect workers that died on their own; synthesize a `Crashed` result for
/// any execution they took down with them
async fn check_crashes(shared: &Arc<PoolShared>) {
    let dead: Vec<(ProcessHandle, Option<ExecutionDescriptor>)> = {
        let mut state = shared.state.lock().await;
        let mut dead_ids = Vec::new();
        for handle in state.handles.values_mut() {
            if !handle.link.is_alive() {
                dead_ids.push(handle.id.clone());
            }
        }
        dead_ids
            .into_iter()
            .filter_map(|id| {
                state.handles.remove(&id).map(|mut handle| {
                    handle.state = ProcessState::Killed;
                    let descriptor = handle.current.take();
                    (handle, descriptor)
                })
            })
            .collect()
    };

    for (mut handle, descriptor) in dead {
        let worker_id = handle.id.clone();
        // Already dead; terminate only reaps the exit status
        tokio::spawn(async move {
            handle.link.terminate(Duration::from_millis(100)).await;
        });
        match descriptor {
            Some(descriptor) => {
                error!(
                    worker_id = %worker_id,
                    execution_id = %descriptor.execution_id,
                    "worker crashed mid-execution"
                );
                discard_context(shared, &descriptor.execution_id).await;
                let result = ExecutionResult::failure(
                    descriptor.execution_id.clone(),
                    worker_id,
                    FailureKind::Crashed,
                    "worker process exited unexpectedly during execution",
                    descriptor.elapsed().as_millis() as i64,
                );
                shared.sink.deliver(result).await;
            }
            None => {
                warn!(worker_id = %worker_id, "idle worker exited unexpectedly");
            }
        }
        shared.idle_notify.notify_one();
    }

    ensure_min(shared).await;
}

/// Shrink back toward the minimum size by retiring the oldest idle workers
async fn scale_down(shared: &Arc<PoolShared>) {
    let victims: Vec<ProcessHandle> = {
        let mut state = shared.state.lock().await;
        let mut victims = Vec::new();
        while state.live_count() > shared.config.min_workers {
            let victim_id = state
                .handles
                .values()
                .filter(|h| h.is_idle())
                .min_by_key(|h| h.spawned_at)
                .map(|h| h.id.clone());
            match victim_id {
                Some(id) => {
                    if let Some(mut handle) = state.handles.remove(&id) {
                        handle.state = ProcessState::Killed;
                        victims.push(handle);
                    }
                }
                None => break,
            }
        }
        victims
    };

    for mut handle in victims {
        debug!(worker_id = %handle.id, "scaling down idle worker");
        handle.link.terminate(shared.config.shutdown_grace).await;
    }
}

/// Process one message from the shared worker report channel
async fn handle_report(shared: &Arc<PoolShared>, msg: WorkerReportMessage) {
    match msg.report {
        WorkerReport::Ready { worker_id } => {
            debug!(worker_id = %worker_id, "worker reported ready");
        }
        WorkerReport::Result { result } => {
            let mut recycled: Option<ProcessHandle> = None;
            {
                let mut state = shared.state.lock().await;
                let Some(handle) = state.handles.get_mut(&msg.worker_id) else {
                    // Monitor already resolved this execution and removed
                    // the worker; its late result is dropped
                    warn!(
                        worker_id = %msg.worker_id,
                        execution_id = %result.execution_id,
                        "dropping result from removed worker"
                    );
                    return;
                };
                let Some(descriptor) = handle.finish_execution() else {
                    warn!(
                        worker_id = %msg.worker_id,
                        execution_id = %result.execution_id,
                        "dropping result with no matching in-flight execution"
                    );
                    return;
                };
                if descriptor.execution_id != result.execution_id {
                    error!(
                        worker_id = %msg.worker_id,
                        expected = %descriptor.execution_id,
                        reported = %result.execution_id,
                        "worker reported a result for the wrong execution, replacing it"
                    );
                    // A worker that answers out of protocol cannot be
                    // trusted with further work; fail the execution it was
                    // actually running and swap in a fresh process
                    let rogue = state.handles.remove(&msg.worker_id).map(|mut h| {
                        h.state = ProcessState::Killed;
                        h
                    });
                    if rogue.is_some() {
                        state.spawning += 1;
                    }
                    drop(state);
                    discard_context(shared, &descriptor.execution_id).await;
                    let failure = ExecutionResult::failure(
                        descriptor.execution_id.clone(),
                        msg.worker_id.clone(),
                        FailureKind::Crashed,
                        format!(
                            "worker answered with a result for {} while running {}",
                            result.execution_id, descriptor.execution_id
                        ),
                        descriptor.elapsed().as_millis() as i64,
                    );
                    shared.sink.deliver(failure).await;
                    if let Some(mut rogue) = rogue {
                        rogue.link.terminate(shared.config.shutdown_grace).await;
                        if let Err(e) = spawn_reserved(shared).await {
                            warn!(error = %e, "failed to spawn replacement for misbehaving worker");
                        }
                    }
                    return;
                }

                let recycle_after = shared.config.recycle_after;
                if recycle_after > 0 && handle.executions_completed >= recycle_after {
                    if let Some(mut old) = state.handles.remove(&msg.worker_id) {
                        old.state = ProcessState::Killed;
                        state.spawning += 1;
                        recycled = Some(old);
                    }
                }
            }

            shared.sink.deliver(result).await;

            match recycled {
                Some(mut old) => {
                    info!(
                        worker_id = %old.id,
                        executions = old.executions_completed,
                        "worker reached recycle threshold, replacing"
                    );
                    old.link.terminate(shared.config.shutdown_grace).await;
                    if let Err(e) = spawn_reserved(shared).await {
                        warn!(error = %e, "failed to spawn replacement for recycled worker");
                    }
                }
                None => shared.idle_notify.notify_one(),
            }
        }
    }
}

/// Publish a pool snapshot to the registry, extending the registration TTL
async fn heartbeat(shared: &Arc<PoolShared>) {
    let snapshot = build_snapshot(shared).await;
    if let Err(e) = shared
        .registry
        .refresh(&snapshot, shared.config.registration_ttl)
        .await
    {
        warn!(pool_id = %shared.pool_id, error = %e, "heartbeat refresh failed");
    }
}

async fn build_snapshot(shared: &Arc<PoolShared>) -> PoolSnapshot {
    let state = shared.state.lock().await;
    let mut workers: Vec<WorkerSnapshot> = state
        .handles
        .values()
        .map(|h| WorkerSnapshot {
            process_id: h.id.clone(),
            pid: h.pid(),
            state: h.state,
            memory_mb: h.memory_mb(),
            uptime_seconds: h.uptime_seconds(),
            executions_completed: h.executions_completed,
            current_execution: h.current.as_ref().map(|d| CurrentExecution {
                execution_id: d.execution_id.clone(),
                elapsed_ms: d.elapsed().as_millis() as u64,
            }),
        })
        .collect();
    workers.sort_by(|a, b| a.process_id.cmp(&b.process_id));
    let idle_count = workers
        .iter()
        .filter(|w| w.state == ProcessState::Idle)
        .count();
    let busy_count = workers
        .iter()
        .filter(|w| w.state == ProcessState::Busy)
        .count();
    PoolSnapshot {
        pool_id: shared.pool_id.clone(),
        timestamp: chrono::Utc::now(),
        pool_size: workers.len(),
        idle_count,
        busy_count,
        workers,
    }
}
