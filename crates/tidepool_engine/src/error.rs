//! Error types for the engine.

use thiserror::Error;
use tidepool_protocol::ProtocolError;
use tidepool_storage::StorageError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The backend rejected the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Not connected to the backend.
    #[error("not connected to server")]
    NotConnected,

    /// Wire record or message error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Durable store error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Local row store error.
    #[error("local store error: {0}")]
    LocalStore(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No channel is subscribed to the topic.
    #[error("no channel for topic {0}")]
    UnknownChannel(String),

    /// The referenced item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine was wired incorrectly.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::Timeout => true,
            EngineError::ServerError(_) => true,
            EngineError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if the error is a local data defect.
    pub fn is_data_defect(&self) -> bool {
        matches!(self, EngineError::Protocol(e) if e.is_data_defect())
    }
}
