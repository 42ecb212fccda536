//! The worker execution loop
//!
//! Protocol traffic owns stdout; all logging inside a worker process must
//! go to stderr. The loop reports `Ready` once, then serves one order at a
//! time until it receives `Shutdown` or its pipes close.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use flowrun_ipc::{
    ContextStore, ExecutionResult, FailureKind, IpcError, IpcTransport, MessageEnvelope,
    StdioTransport, WorkOrder, WorkerReport,
};

use crate::engine::{EngineRequest, ExecutionInput, WorkflowEngine};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker transport error: {0}")]
    Ipc(#[from] IpcError),
}

pub struct Worker<T: IpcTransport> {
    worker_id: String,
    transport: T,
    engine: Arc<dyn WorkflowEngine>,
    store: Arc<dyn ContextStore>,
}

impl<T: IpcTransport> Worker<T> {
    pub fn new(
        worker_id: impl Into<String>,
        transport: T,
        engine: Arc<dyn WorkflowEngine>,
        store: Arc<dyn ContextStore>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            transport,
            engine,
            store,
        }
    }

    /// Announce readiness, then serve work orders until shutdown or the
    /// manager side of the pipes goes away
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        self.transport
            .send(&MessageEnvelope::new(WorkerReport::Ready {
                worker_id: self.worker_id.clone(),
            }))
            .await?;
        info!(worker_id = %self.worker_id, "worker ready");

        loop {
            let envelope: MessageEnvelope<WorkOrder> = match self.transport.receive().await {
                Ok(envelope) => envelope,
                Err(e) if e.is_disconnect() => {
                    info!(worker_id = %self.worker_id, "manager disconnected, exiting");
                    return Ok(());
                }
                Err(e) => {
                    // Malformed line; skip it and keep serving
                    warn!(worker_id = %self.worker_id, error = %e, "discarding unreadable work order");
                    continue;
                }
            };

            match envelope.message {
                WorkOrder::Shutdown => {
                    info!(worker_id = %self.worker_id, "shutdown requested, exiting");
                    return Ok(());
                }
                WorkOrder::Execute { execution_id } => {
                    debug!(worker_id = %self.worker_id, execution_id = %execution_id, "executing");
                    let result = self.execute_one(&execution_id).await;
                    self.transport
                        .send(&MessageEnvelope::new(WorkerReport::Result { result }))
                        .await?;
                }
            }
        }
    }

    /// Run one execution to a terminal result. Never panics the loop: every
    /// failure mode maps to a failed result.
    async fn execute_one(&self, execution_id: &str) -> ExecutionResult {
        let started = Instant::now();
        let elapsed_ms = |s: Instant| s.elapsed().as_millis() as i64;

        let context = match self.store.take(execution_id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                return ExecutionResult::failure(
                    execution_id,
                    self.worker_id.clone(),
                    FailureKind::ContextNotFound,
                    format!("no staged context for execution {execution_id}"),
                    elapsed_ms(started),
                )
            }
            Err(e) => {
                return ExecutionResult::failure(
                    execution_id,
                    self.worker_id.clone(),
                    FailureKind::ContextNotFound,
                    format!("context store read failed: {e}"),
                    elapsed_ms(started),
                )
            }
        };

        let input: ExecutionInput = match serde_json::from_value(context) {
            Ok(input) => input,
            Err(e) => {
                return ExecutionResult::failure(
                    execution_id,
                    self.worker_id.clone(),
                    FailureKind::EngineFailure,
                    format!("invalid execution input: {e}"),
                    elapsed_ms(started),
                )
            }
        };

        let request = EngineRequest {
            execution_id: execution_id.to_string(),
            input,
        };
        match self.engine.execute(request).await {
            Ok(output) => ExecutionResult::success(
                execution_id,
                self.worker_id.clone(),
                output,
                elapsed_ms(started),
            ),
            Err(e) => ExecutionResult::failure(
                execution_id,
                self.worker_id.clone(),
                FailureKind::EngineFailure,
                e.to_string(),
                elapsed_ms(started),
            ),
        }
    }
}

/// Entry point for the spawned worker mode of the binary
pub async fn worker_main(
    worker_id: String,
    engine: Arc<dyn WorkflowEngine>,
    store: Arc<dyn ContextStore>,
) -> Result<(), WorkerError> {
    let mut worker = Worker::new(worker_id, StdioTransport::new(), engine, store);
    worker.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EchoEngine;
    use async_trait::async_trait;
    use flowrun_ipc::{decode_line, encode_line, InMemoryContextStore};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::collections::VecDeque;

    /// Transport fed from a queue of pre-encoded lines; captures everything
    /// the worker sends
    struct ScriptedTransport {
        incoming: VecDeque<String>,
        outgoing: Vec<String>,
    }

    impl ScriptedTransport {
        fn with_orders(orders: Vec<WorkOrder>) -> Self {
            let incoming = orders
                .into_iter()
                .map(|order| encode_line(&MessageEnvelope::new(order)).unwrap())
                .collect();
            Self {
                incoming,
                outgoing: Vec::new(),
            }
        }

        fn reports(&self) -> Vec<WorkerReport> {
            self.outgoing
                .iter()
                .map(|line| decode_line::<WorkerReport>(line).unwrap().message)
                .collect()
        }
    }

    #[async_trait]
    impl IpcTransport for ScriptedTransport {
        async fn send<T: Serialize + Send + Sync>(
            &mut self,
            envelope: &MessageEnvelope<T>,
        ) -> Result<(), IpcError> {
            self.outgoing.push(encode_line(envelope)?);
            Ok(())
        }

        async fn receive<T: for<'de> Deserialize<'de> + Send>(
            &mut self,
        ) -> Result<MessageEnvelope<T>, IpcError> {
            match self.incoming.pop_front() {
                Some(line) => decode_line(&line),
                None => Err(IpcError::ChannelClosed),
            }
        }
    }

    async fn run_worker(
        orders: Vec<WorkOrder>,
        store: Arc<InMemoryContextStore>,
    ) -> Vec<WorkerReport> {
        let mut worker = Worker::new(
            "w-test",
            ScriptedTransport::with_orders(orders),
            Arc::new(EchoEngine),
            store as Arc<dyn ContextStore>,
        );
        worker.run().await.unwrap();
        worker.transport.reports()
    }

    #[tokio::test]
    async fn test_worker_reports_ready_then_executes() {
        let store = Arc::new(InMemoryContextStore::new());
        store
            .put("e1", json!({"params": {"k": "v"}}))
            .await
            .unwrap();

        let reports = run_worker(
            vec![
                WorkOrder::Execute {
                    execution_id: "e1".to_string(),
                },
                WorkOrder::Shutdown,
            ],
            Arc::clone(&store),
        )
        .await;

        assert_eq!(reports.len(), 2);
        match &reports[0] {
            WorkerReport::Ready { worker_id } => assert_eq!(worker_id, "w-test"),
            other => panic!("expected Ready first, got {:?}", other),
        }
        match &reports[1] {
            WorkerReport::Result { result } => {
                assert!(result.success);
                assert_eq!(result.execution_id, "e1");
                assert_eq!(result.worker_id, "w-test");
                assert_eq!(result.output.as_ref().unwrap()["echo"]["k"], "v");
            }
            other => panic!("expected Result, got {:?}", other),
        }

        // the context was consumed
        assert!(store.take("e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_context_reports_context_not_found() {
        let store = Arc::new(InMemoryContextStore::new());
        let reports = run_worker(
            vec![WorkOrder::Execute {
                execution_id: "missing".to_string(),
            }],
            store,
        )
        .await;

        match &reports[1] {
            WorkerReport::Result { result } => {
                assert!(!result.success);
                assert_eq!(
                    result.error.as_ref().unwrap().kind,
                    FailureKind::ContextNotFound
                );
            }
            other => panic!("expected Result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_context_reports_engine_failure() {
        let store = Arc::new(InMemoryContextStore::new());
        store.put("e2", json!("not an object")).await.unwrap();

        let reports = run_worker(
            vec![WorkOrder::Execute {
                execution_id: "e2".to_string(),
            }],
            store,
        )
        .await;

        match &reports[1] {
            WorkerReport::Result { result } => {
                assert!(!result.success);
                assert_eq!(
                    result.error.as_ref().unwrap().kind,
                    FailureKind::EngineFailure
                );
            }
            other => panic!("expected Result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_exits_cleanly_on_disconnect() {
        let store = Arc::new(InMemoryContextStore::new());
        let reports = run_worker(Vec::new(), store).await;
        assert_eq!(reports.len(), 1); // just the Ready announcement
    }
}
