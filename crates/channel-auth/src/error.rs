//! Error types for credential operations

/// Errors from credential refresh operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("no refresh token available")]
    MissingRefreshToken,
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
