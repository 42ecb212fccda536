//! Line-delimited JSON framing over stdio pipe pairs
//!
//! A worker owns both halves of its pipe pair and uses [`StdioTransport`].
//! The pool-manager side splits the pair across a stdin writer task and a
//! stdout reader task, so it uses the bare [`encode_line`]/[`decode_line`]
//! framing functions directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, PROTOCOL_VERSION};

/// Encode one envelope as a newline-terminated JSON line
pub fn encode_line<T: Serialize>(envelope: &MessageEnvelope<T>) -> Result<String, IpcError> {
    let json = serde_json::to_string(envelope).map_err(|e| IpcError::Encode(e.to_string()))?;
    Ok(format!("{}\n", json))
}

/// Decode one line into an envelope, rejecting incompatible protocol versions
pub fn decode_line<T: for<'de> Deserialize<'de>>(
    line: &str,
) -> Result<MessageEnvelope<T>, IpcError> {
    let envelope: MessageEnvelope<T> =
        serde_json::from_str(line.trim_end()).map_err(|e| IpcError::Decode(e.to_string()))?;

    if !envelope.is_compatible() {
        return Err(IpcError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }

    Ok(envelope)
}

/// Transport over one end of a pipe pair
#[async_trait]
pub trait IpcTransport: Send {
    /// Write one envelope as a single line
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        envelope: &MessageEnvelope<T>,
    ) -> Result<(), IpcError>;

    /// Read the next envelope
    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError>;
}

/// Transport used inside a worker process: reads orders from stdin, writes
/// reports to stdout. Stdout is reserved for protocol traffic; diagnostics
/// must go to stderr.
pub struct StdioTransport {
    reader: BufReader<tokio::io::Stdin>,
    writer: tokio::io::Stdout,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            writer: tokio::io::stdout(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpcTransport for StdioTransport {
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        envelope: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let line = encode_line(envelope)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(IpcError::ChannelClosed);
        }
        decode_line(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkOrder;

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelope = MessageEnvelope::new(WorkOrder::Execute {
            execution_id: "exec-7".to_string(),
        });

        let line = encode_line(&envelope).unwrap();
        assert!(line.ends_with('\n'));

        let back: MessageEnvelope<WorkOrder> = decode_line(&line).unwrap();
        match back.message {
            WorkOrder::Execute { execution_id } => assert_eq!(execution_id, "exec-7"),
            other => panic!("unexpected order: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_version_mismatch() {
        let mut envelope = MessageEnvelope::new(WorkOrder::Shutdown);
        envelope.protocol_version = PROTOCOL_VERSION + 1;
        let line = serde_json::to_string(&envelope).unwrap();

        let result = decode_line::<WorkOrder>(&line);
        match result {
            Err(IpcError::VersionMismatch { expected, actual }) => {
                assert_eq!(expected, PROTOCOL_VERSION);
                assert_eq!(actual, PROTOCOL_VERSION + 1);
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_line::<WorkOrder>("not json at all"),
            Err(IpcError::Decode(_))
        ));
    }
}
