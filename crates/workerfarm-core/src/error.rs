use crate::WorkerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FarmError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailure(String),

    #[error("{worker} died with calls still pending")]
    WorkerDied { worker: WorkerId },

    #[error("{worker} was terminated")]
    WorkerTerminated { worker: WorkerId },

    #[error("Call failed: {0}")]
    CallFailure(String),

    #[error("Nested call failed: {0}")]
    NestedCallFailure(String),

    #[error("{worker} failed to initialize: {message}")]
    InitFailure { worker: WorkerId, message: String },

    #[error("Serialization error: {0}")]
    SerializationFailure(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Worker farm is shutting down")]
    ShuttingDown,

    #[error("Worker pool failed permanently: {0}")]
    PersistentFailure(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl FarmError {
    /// Errors caused by the worker going away rather than by the call itself
    pub fn is_worker_loss(&self) -> bool {
        matches!(
            self,
            FarmError::WorkerDied { .. } | FarmError::WorkerTerminated { .. } | FarmError::ChannelClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, FarmError>;

/// Failure category carried in an `error` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Call,
    NestedCall,
    Init,
    Serialization,
    UnknownMethod,
}

/// Wire form of a failure, answered to the caller of one call id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        RemoteError {
            kind,
            message: message.into(),
        }
    }

    pub fn call(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Call, message)
    }
}

impl From<RemoteError> for FarmError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::Call => FarmError::CallFailure(err.message),
            RemoteErrorKind::NestedCall => FarmError::NestedCallFailure(err.message),
            // The bridge does not know which worker it serves; callers that
            // do re-tag this as InitFailure.
            RemoteErrorKind::Init => FarmError::Protocol(format!("init rejected: {}", err.message)),
            RemoteErrorKind::Serialization => FarmError::SerializationFailure(err.message),
            RemoteErrorKind::UnknownMethod => {
                FarmError::CallFailure(format!("unknown method: {}", err.message))
            }
        }
    }
}

impl From<&FarmError> for RemoteError {
    fn from(err: &FarmError) -> Self {
        let kind = match err {
            FarmError::NestedCallFailure(_) => RemoteErrorKind::NestedCall,
            FarmError::SerializationFailure(_) => RemoteErrorKind::Serialization,
            FarmError::InitFailure { .. } => RemoteErrorKind::Init,
            _ => RemoteErrorKind::Call,
        };
        let message = match err {
            FarmError::CallFailure(m)
            | FarmError::NestedCallFailure(m)
            | FarmError::SerializationFailure(m) => m.clone(),
            other => other.to_string(),
        };
        RemoteError { kind, message }
    }
}
