//! Router error types

use crosspoint_core::CrosspointId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("crosspoint {0} is already registered")]
    DuplicateId(CrosspointId),

    #[error("crosspoint {0} not found")]
    NotFound(CrosspointId),

    #[error("invalid crosspoint id: {0}")]
    InvalidId(CrosspointId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] crosspoint_transport::TransportError),

    #[error("core error: {0}")]
    Core(#[from] crosspoint_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
