//! The workflow engine seam
//!
//! The worker loop is engine-agnostic: anything implementing
//! [`WorkflowEngine`] can be plugged in. The staged context blob decodes
//! into [`ExecutionInput`] before it reaches the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid execution input: {0}")]
    InvalidInput(String),

    #[error("workflow failed: {0}")]
    Failed(String),
}

/// Execution input as staged in the context store by the enqueuer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInput {
    /// Caller-supplied workflow parameters
    #[serde(default)]
    pub params: JsonValue,

    /// Reference to the workflow definition to run
    #[serde(default)]
    pub code_ref: Option<String>,

    /// Identity of the enqueuing caller, for audit logging
    #[serde(default)]
    pub caller: Option<String>,

    /// Requested timeout, informational only; enforcement happens in the
    /// pool manager
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// One decoded request handed to the engine
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub execution_id: String,
    pub input: ExecutionInput,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn execute(&self, request: EngineRequest) -> Result<JsonValue, EngineError>;
}

/// Engine that echoes its parameters back as the output. Used by smoke
/// tests and as the default until a real engine is wired in.
pub struct EchoEngine;

#[async_trait]
impl WorkflowEngine for EchoEngine {
    async fn execute(&self, request: EngineRequest) -> Result<JsonValue, EngineError> {
        Ok(serde_json::json!({
            "execution_id": request.execution_id,
            "echo": request.input.params,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_decodes_with_defaults() {
        let input: ExecutionInput = serde_json::from_value(json!({})).unwrap();
        assert!(input.params.is_null());
        assert!(input.code_ref.is_none());

        let input: ExecutionInput = serde_json::from_value(json!({
            "params": {"x": 1},
            "code_ref": "wf://orders/v3",
            "caller": "api-gw",
        }))
        .unwrap();
        assert_eq!(input.params["x"], 1);
        assert_eq!(input.code_ref.as_deref(), Some("wf://orders/v3"));
    }

    #[tokio::test]
    async fn test_echo_engine_returns_params() {
        let engine = EchoEngine;
        let output = engine
            .execute(EngineRequest {
                execution_id: "e1".to_string(),
                input: ExecutionInput {
                    params: json!({"a": true}),
                    code_ref: None,
                    caller: None,
                    timeout_seconds: None,
                },
            })
            .await
            .unwrap();
        assert_eq!(output["echo"]["a"], true);
        assert_eq!(output["execution_id"], "e1");
    }
}
