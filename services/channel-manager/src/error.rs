//! Service error types

use thiserror::Error;

/// Startup errors: configuration loading and validation.
///
/// Pool errors raised while serving requests are answered as HTTP responses
/// and never propagate as service errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Metrics setup failed: {0}")]
    Metrics(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
