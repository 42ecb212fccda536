//! Process handles and the seams between the manager and worker processes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use flowrun_ipc::{ExecutionResult, IpcError, WorkOrder, WorkerReport};

use crate::error::PoolError;

/// Lifecycle state of one worker process, as tracked by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Ready for new work
    Idle,
    /// Executing exactly one workflow
    Busy,
    /// Terminal: terminated and about to leave the live set
    Killed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Idle => write!(f, "idle"),
            ProcessState::Busy => write!(f, "busy"),
            ProcessState::Killed => write!(f, "killed"),
        }
    }
}

/// Ephemeral record of the execution in flight on a busy process.
///
/// Created on assignment, destroyed exactly once: either by the result loop
/// on worker report or by the monitor loop on timeout/crash. Whichever side
/// takes it out of the handle owns its resolution.
#[derive(Debug, Clone)]
pub struct ExecutionDescriptor {
    pub execution_id: String,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    pub timeout: Duration,
}

impl ExecutionDescriptor {
    pub fn new(execution_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            execution_id: execution_id.into(),
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.timeout
    }
}

/// A report from one worker, tagged with its identity, funneled into the
/// manager's single result-collection channel
#[derive(Debug)]
pub struct WorkerReportMessage {
    pub worker_id: String,
    pub report: WorkerReport,
}

/// Manager-side end of one worker's channel pair.
///
/// `send` is the work channel; results arrive out-of-band on the shared
/// report channel handed to the spawner. `terminate` is the single kill
/// escalation primitive used by timeout handling, recycle, scale-down, and
/// pool shutdown alike.
#[async_trait]
pub trait WorkerLink: Send {
    /// OS process id, when the worker is a real process
    fn pid(&self) -> Option<u32>;

    /// Resident memory of the worker process, when measurable
    fn memory_mb(&self) -> Option<u64> {
        None
    }

    /// Send an order on the work channel
    async fn send(&mut self, order: WorkOrder) -> Result<(), IpcError>;

    /// Whether the underlying process is still running
    fn is_alive(&mut self) -> bool;

    /// Two-phase kill: graceful termination request, wait up to `grace`,
    /// then forceful kill and reap. Must leave no orphan process behind.
    async fn terminate(&mut self, grace: Duration);
}

/// Factory for worker processes; the seam that lets tests drive the pool
/// with scripted in-process workers
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(
        &self,
        worker_id: &str,
        report_tx: mpsc::UnboundedSender<WorkerReportMessage>,
    ) -> Result<Box<dyn WorkerLink>, PoolError>;
}

/// Caller-supplied destination for terminal execution results
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: ExecutionResult);
}

/// The manager's record of one worker process. Owned exclusively by the
/// pool state mutex; never touched by the worker itself.
pub struct ProcessHandle {
    pub id: String,
    pub state: ProcessState,
    pub spawned_at: Instant,
    pub spawned_at_utc: DateTime<Utc>,
    pub executions_completed: u64,
    pub current: Option<ExecutionDescriptor>,
    pub link: Box<dyn WorkerLink>,
}

impl ProcessHandle {
    pub fn new(id: impl Into<String>, link: Box<dyn WorkerLink>) -> Self {
        Self {
            id: id.into(),
            state: ProcessState::Idle,
            spawned_at: Instant::now(),
            spawned_at_utc: Utc::now(),
            executions_completed: 0,
            current: None,
            link,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.link.pid()
    }

    pub fn memory_mb(&self) -> Option<u64> {
        self.link.memory_mb()
    }

    pub fn is_idle(&self) -> bool {
        self.state == ProcessState::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.state == ProcessState::Busy
    }

    /// Idle -> Busy with an attached descriptor
    pub fn begin_execution(&mut self, descriptor: ExecutionDescriptor) {
        debug_assert!(self.is_idle());
        self.state = ProcessState::Busy;
        self.current = Some(descriptor);
    }

    /// Busy -> Idle, handing back the descriptor if it was still unresolved
    pub fn finish_execution(&mut self) -> Option<ExecutionDescriptor> {
        let descriptor = self.current.take();
        if descriptor.is_some() {
            self.executions_completed += 1;
        }
        self.state = ProcessState::Idle;
        descriptor
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.spawned_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct NoopLink {
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl WorkerLink for NoopLink {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn send(&mut self, _order: WorkOrder) -> Result<(), IpcError> {
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn terminate(&mut self, _grace: Duration) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    fn noop_handle() -> ProcessHandle {
        ProcessHandle::new(
            "worker-0",
            Box::new(NoopLink {
                alive: Arc::new(AtomicBool::new(true)),
            }),
        )
    }

    #[test]
    fn test_handle_starts_idle() {
        let handle = noop_handle();
        assert!(handle.is_idle());
        assert!(handle.current.is_none());
        assert_eq!(handle.executions_completed, 0);
        assert_eq!(handle.pid(), Some(4242));
    }

    #[test]
    fn test_begin_and_finish_execution() {
        let mut handle = noop_handle();
        handle.begin_execution(ExecutionDescriptor::new("e1", Duration::from_secs(30)));
        assert!(handle.is_busy());
        assert_eq!(handle.current.as_ref().unwrap().execution_id, "e1");

        let descriptor = handle.finish_execution();
        assert_eq!(descriptor.unwrap().execution_id, "e1");
        assert!(handle.is_idle());
        assert_eq!(handle.executions_completed, 1);
    }

    #[test]
    fn test_finish_without_descriptor_does_not_count() {
        let mut handle = noop_handle();
        handle.state = ProcessState::Busy;
        assert!(handle.finish_execution().is_none());
        assert_eq!(handle.executions_completed, 0);
    }

    #[test]
    fn test_descriptor_expiry() {
        let descriptor = ExecutionDescriptor::new("e2", Duration::from_millis(0));
        assert!(descriptor.is_expired());

        let descriptor = ExecutionDescriptor::new("e3", Duration::from_secs(3600));
        assert!(!descriptor.is_expired());
    }
}
