/// Error taxonomy shared by the transport, queue and scheduler
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Radio / interface bring-up failure. Retried with escalating backoff.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link unavailable: {0}")]
    Unavailable(String),
    #[error("link bring-up timed out after {0:?}")]
    Timeout(Duration),
}

/// Malformed handshake or frame. The connection is torn down, never repaired in place.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),
    #[error("handshake accept key does not match request key")]
    AcceptMismatch,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("fragmented frames are not supported")]
    Fragmented,
    #[error("frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(u64),
    #[error("client frame is not masked")]
    UnmaskedClientFrame,
    #[error("text frame is not valid utf-8")]
    InvalidUtf8,
    #[error("stream ended in the middle of a frame")]
    Truncated,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Anything that ends a transport session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no liveness response within {0:?}")]
    LivenessTimeout(Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("write to peer failed or timed out")]
    WriteFailed,
}

/// Durable storage failure. The only class surfaced unrecovered.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize reading {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Failure of a hardware collaborator (relay read or sensor capture).
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("relay read failed: {0}")]
    Relay(String),
    #[error("sensor capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            key,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
