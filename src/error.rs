use thiserror::Error;

use crate::types::JobId;

/// Errors surfaced by the task engine and its collaborators.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Request rejected before any task was created.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The scan target could not be resolved at all.
    #[error("cannot resolve host {host}: {reason}")]
    HostResolution { host: String, reason: String },

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A persistence or notification collaborator failed.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown session: {0}")]
    UnknownSession(u64),

    #[error("subscriber closed")]
    Closed,
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
