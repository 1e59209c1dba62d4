//! Shared error type for configuration and common utilities

use thiserror::Error;

/// Errors produced by the common library
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A setting is missing or has an invalid value
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using the common error type
pub type Result<T> = std::result::Result<T, Error>;
