//! Discovery error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("broadcast error: {0}")]
    Broadcast(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid announcement: {0}")]
    InvalidAnnouncement(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("discovery error: {0}")]
    Other(String),
}
