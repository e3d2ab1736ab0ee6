//! Error types for the accumulator.

use std::time::Duration;

use thiserror::Error;

/// Main error type for accumulator operations.
#[derive(Error, Debug)]
pub enum AccumulatorError {
    /// A window length of zero was supplied
    #[error("Window length must be greater than zero")]
    ZeroWindow,

    /// A limit of zero was supplied
    #[error("Limit must be greater than zero")]
    ZeroLimit,

    /// The window length does not fit the nanosecond clock domain
    #[error("Window length {0:?} is too long")]
    WindowTooLong(Duration),

    /// Shard counts must be non-zero powers of two
    #[error("Shard count must be a non-zero power of two, got {0}")]
    InvalidShardCount(usize),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The process-wide limiter was installed twice
    #[error("Default limiter already initialized")]
    AlreadyInitialized,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for accumulator operations.
pub type Result<T> = std::result::Result<T, AccumulatorError>;
