//! Error types for magma-core.

use thiserror::Error;

/// Result type for magma-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in magma-core.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The worker binary could not be found or started.
    #[error("worker error: {0}")]
    Worker(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Document is not open in the host.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// The session has been shut down.
    #[error("session is shut down")]
    ShutDown,
}

impl Error {
    /// Recovery hint for the error, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::Worker(_) => Some(
                "build the magma-worker binary, or point MAGMA_WORKER_PATH at it",
            ),
            Error::Config(_) => Some("check the JSON config file and MAGMA_* environment variables"),
            Error::Deserialization(_) => {
                Some("the stored namespace can be cleared with `magma reset <document>`")
            }
            _ => None,
        }
    }

    /// Error message followed by its recovery hint.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
