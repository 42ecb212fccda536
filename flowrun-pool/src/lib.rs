//! Worker process pool for workflow execution
//!
//! The pool manager keeps a bounded set of reusable worker OS processes,
//! routes each workflow execution onto an idle worker, enforces per-execution
//! timeouts with kill escalation, recovers from worker crashes, and scales
//! the worker set elastically between its configured minimum and maximum.

pub mod error;
pub mod handle;
pub mod manager;
pub mod registry;
pub mod spawn;

pub use error::PoolError;
pub use handle::{
    ExecutionDescriptor, ProcessHandle, ProcessState, ResultSink, WorkerLink, WorkerReportMessage,
    WorkerSpawner,
};
pub use manager::{PoolManager, PoolStats};
pub use registry::{
    CurrentExecution, FsRegistry, InMemoryRegistry, PoolRegistry, PoolSnapshot, RegistryError,
    WorkerSnapshot,
};
pub use spawn::ProcessSpawner;
