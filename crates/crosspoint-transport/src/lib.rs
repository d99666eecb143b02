//! Crosspoint Transport Layer
//!
//! Transport implementations consumed by the routing core:
//! - TCP (raw byte stream, framing is done by the consumer)
//! - UDP (discovery announcements)
//! - Memory (in-process network for tests and embedding)

pub mod error;
pub mod traits;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "udp")]
pub mod udp;

#[cfg(feature = "memory")]
pub mod memory;

pub use error::{Result, TransportError};
pub use traits::{
    Connection, TransportConnector, TransportEvent, TransportReceiver, TransportSender,
    TransportServer,
};

#[cfg(feature = "tcp")]
pub use tcp::{TcpConfig, TcpReceiver, TcpSender, TcpServer, TcpTransport};

#[cfg(feature = "udp")]
pub use udp::{UdpConfig, UdpEndpoint, UdpReceiver};

#[cfg(feature = "memory")]
pub use memory::{MemoryConnector, MemoryNetwork, MemoryReceiver, MemorySender, MemoryServer};
