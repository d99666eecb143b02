//! Error types for crosspoint core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope could not be serialized
    #[error("encode error: {0}")]
    EncodeError(String),

    /// Envelope could not be parsed
    #[error("decode error: {0}")]
    DecodeError(String),

    /// A frame grew past the configured limit before its delimiter arrived
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Crosspoint ids must be non-zero
    #[error("invalid crosspoint id: {0}")]
    InvalidId(u32),

    /// Bad configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

