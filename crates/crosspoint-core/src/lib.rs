//! Crosspoint Core
//!
//! Core types, encoding and framing primitives for crosspoint routing.
//!
//! A crosspoint is a routing endpoint identified by an integer id. Control
//! crosspoints (user interface panels) connect to equipment crosspoints
//! (hardware drivers) and exchange signal traffic wrapped in an [`Envelope`].
//!
//! This crate provides:
//! - Envelope and signal types ([`Envelope`], [`Signal`], [`MessageType`])
//! - Connection status ([`ConnectionStatus`])
//! - Network identity ([`CrosspointInfo`], [`HostInfo`])
//! - The envelope wire codec ([`codec`])
//! - Delimiter based stream framing ([`DelimiterFramer`])

pub mod codec;
pub mod error;
pub mod framing;
pub mod info;
pub mod status;
pub mod types;

pub use codec::{decode, encode, encode_frame};
pub use error::{Error, Result};
pub use framing::DelimiterFramer;
pub use info::{CrosspointInfo, HostInfo};
pub use status::ConnectionStatus;
pub use types::*;

/// Byte terminating every envelope on a stream transport
pub const DEFAULT_DELIMITER: u8 = 0x00;

/// Maximum size of a single framed envelope (64KB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Base TCP port; a system listens on `DEFAULT_BASE_PORT + system_id`
pub const DEFAULT_BASE_PORT: u16 = 41800;

/// Default UDP port for discovery announcements
pub const DEFAULT_DISCOVERY_PORT: u16 = 41799;
