//! Inter-process communication for the flowrun execution pool
//!
//! This crate defines the wire protocol spoken between the pool manager and
//! its worker processes (newline-delimited JSON envelopes), the transport
//! framing for both ends of the pipe pair, and the context store used to
//! hand execution input from enqueuer to worker.

pub mod context;
pub mod error;
pub mod protocol;
pub mod transport;

pub use context::{ContextStore, FsContextStore, InMemoryContextStore, StoreError};
pub use error::IpcError;
pub use protocol::{
    ExecutionFailure, ExecutionResult, FailureKind, MessageEnvelope, WorkOrder, WorkerReport,
    PROTOCOL_VERSION,
};
pub use transport::{decode_line, encode_line, IpcTransport, StdioTransport};
