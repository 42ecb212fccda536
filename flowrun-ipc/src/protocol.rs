//! Protocol message definitions for pool <-> worker communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Protocol version for compatibility checking between pool and workers
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the pool manager to a worker (the work channel).
///
/// The work channel deliberately carries only the execution identifier; the
/// worker fetches the full input from the context store itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkOrder {
    /// Run the execution identified by `execution_id`
    Execute { execution_id: String },

    /// Graceful termination request; a worker receiving this while idle
    /// exits immediately and cleanly
    Shutdown,
}

/// Messages sent from a worker back to the pool manager (the result channel)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    /// Worker finished startup and is blocked waiting for work
    Ready { worker_id: String },

    /// Terminal outcome for one execution attempt
    Result { result: ExecutionResult },
}

/// Outcome of one execution attempt, produced exactly once per attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub success: bool,
    pub output: Option<JsonValue>,
    pub error: Option<ExecutionFailure>,
    pub duration_ms: i64,
    pub worker_id: String,
}

impl ExecutionResult {
    /// Build a successful result
    pub fn success(
        execution_id: impl Into<String>,
        worker_id: impl Into<String>,
        output: JsonValue,
        duration_ms: i64,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
            worker_id: worker_id.into(),
        }
    }

    /// Build a failed result with the given classification
    pub fn failure(
        execution_id: impl Into<String>,
        worker_id: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        duration_ms: i64,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            success: false,
            output: None,
            error: Some(ExecutionFailure {
                kind,
                message: message.into(),
            }),
            duration_ms,
            worker_id: worker_id.into(),
        }
    }
}

/// Error payload attached to failed results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Classification of execution failures.
///
/// `EngineFailure` is a normal failed result and leaves the worker reusable;
/// `Timeout` and `Crashed` are synthesized by the pool manager after killing
/// or losing the owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ContextNotFound,
    Timeout,
    Crashed,
    EngineFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::ContextNotFound => write!(f, "context_not_found"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Crashed => write!(f, "crashed"),
            FailureKind::EngineFailure => write!(f, "engine_failure"),
        }
    }
}

/// Envelope wrapping every message on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_order_roundtrip() {
        let order = WorkOrder::Execute {
            execution_id: "exec-42".to_string(),
        };

        let json = serde_json::to_string(&order).unwrap();
        assert!(json.contains("\"execute\""));

        let back: WorkOrder = serde_json::from_str(&json).unwrap();
        match back {
            WorkOrder::Execute { execution_id } => assert_eq!(execution_id, "exec-42"),
            other => panic!("unexpected order: {:?}", other),
        }
    }

    #[test]
    fn test_result_constructors() {
        let ok = ExecutionResult::success("e1", "w1", serde_json::json!({"n": 1}), 120);
        assert!(ok.success);
        assert!(ok.error.is_none());
        assert_eq!(ok.duration_ms, 120);
        assert_eq!(ok.worker_id, "w1");

        let failed =
            ExecutionResult::failure("e2", "w1", FailureKind::EngineFailure, "boom", 15);
        assert!(!failed.success);
        assert!(failed.output.is_none());
        let error = failed.error.unwrap();
        assert_eq!(error.kind, FailureKind::EngineFailure);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn test_failure_kind_serde_names() {
        let json = serde_json::to_string(&FailureKind::ContextNotFound).unwrap();
        assert_eq!(json, "\"context_not_found\"");

        let kind: FailureKind = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(kind, FailureKind::Timeout);
    }

    #[test]
    fn test_envelope_version() {
        let envelope = MessageEnvelope::new(WorkOrder::Shutdown);
        assert_eq!(envelope.protocol_version, PROTOCOL_VERSION);
        assert!(envelope.is_compatible());

        let json = serde_json::to_string(&envelope).unwrap();
        let back: MessageEnvelope<WorkOrder> = serde_json::from_str(&json).unwrap();
        assert!(back.is_compatible());
    }

    #[test]
    fn test_worker_report_roundtrip() {
        let report = WorkerReport::Result {
            result: ExecutionResult::failure("e3", "w2", FailureKind::Timeout, "exceeded", 5000),
        };

        let json = serde_json::to_string(&MessageEnvelope::new(report)).unwrap();
        let back: MessageEnvelope<WorkerReport> = serde_json::from_str(&json).unwrap();
        match back.message {
            WorkerReport::Result { result } => {
                assert_eq!(result.execution_id, "e3");
                assert_eq!(result.error.unwrap().kind, FailureKind::Timeout);
            }
            other => panic!("unexpected report: {:?}", other),
        }
    }
}
