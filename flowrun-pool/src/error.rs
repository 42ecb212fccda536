//! Pool manager error types

use flowrun_ipc::IpcError;
use thiserror::Error;

/// Errors surfaced by the pool manager's public operations.
///
/// Once work has been handed to a worker, failures are no longer errors on
/// this enum: they are resolved into exactly one `ExecutionResult` and
/// delivered through the configured result sink.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    Config(String),

    #[error("Pool already started")]
    AlreadyStarted,

    #[error("Pool is not running")]
    NotStarted,

    /// Writing the execution context failed before any worker was involved;
    /// the one failure propagated synchronously to the routing caller.
    #[error("Failed to stage execution context: {0}")]
    Routing(String),

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Process {0} is busy and cannot be recycled")]
    ProcessBusy(String),

    #[error("No idle process available to recycle")]
    NoIdleProcess,

    #[error("No live process with pid {0}")]
    ProcessNotFound(u32),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}
