//! Worker-process side of the flowrun execution pool
//!
//! A worker is a single-purpose process: announce readiness, block on the
//! work channel, run one execution at a time through the workflow engine,
//! and report exactly one result per order.

pub mod engine;
pub mod worker;

pub use engine::{EchoEngine, EngineError, EngineRequest, ExecutionInput, WorkflowEngine};
pub use worker::{worker_main, Worker, WorkerError};
