//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Texture or asset bytes could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Unsupported texel format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Out of bounds access
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
