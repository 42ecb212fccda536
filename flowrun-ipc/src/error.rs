//! IPC error types

use thiserror::Error;

/// Errors raised by the IPC transports
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(String),

    /// The peer closed its end of the pipe
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
}

impl IpcError {
    /// Whether the error means the peer process is gone for good
    pub fn is_disconnect(&self) -> bool {
        matches!(self, IpcError::ChannelClosed | IpcError::Io(_))
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(IpcError::ChannelClosed.is_disconnect());
        assert!(IpcError::Io("broken pipe".to_string()).is_disconnect());
        assert!(!IpcError::Decode("bad json".to_string()).is_disconnect());
        assert!(!IpcError::VersionMismatch {
            expected: 1,
            actual: 2
        }
        .is_disconnect());
    }
}
