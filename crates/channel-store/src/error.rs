//! Error types for channel storage

/// Errors from channel storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel record parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("channel not found: {0}")]
    NotFound(String),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
