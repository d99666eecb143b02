//! Transport trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use crosspoint_core::HostInfo;
use std::sync::Arc;

use crate::error::Result;

/// Events that can occur on a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established
    Connected,
    /// Connection closed (clean or error)
    Disconnected { reason: Option<String> },
    /// Raw bytes received, not yet framed
    Data(Bytes),
    /// Error occurred
    Error(String),
}

/// Trait for sending data
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Queue data, waiting for buffer space
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Queue data without waiting. Order of queued data is preserved.
    fn try_send(&self, data: Bytes) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close the sender
    async fn close(&self) -> Result<()>;
}

/// Trait for receiving data
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next event
    async fn recv(&mut self) -> Option<TransportEvent>;
}

/// An established outbound connection
pub type Connection = (Arc<dyn TransportSender>, Box<dyn TransportReceiver>);

/// Factory for outbound connections
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect to a remote host
    async fn connect(&self, host: &HostInfo) -> Result<Connection>;
}

/// Trait for transport servers (listeners)
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// The sender type for accepted connections
    type Sender: TransportSender;
    /// The receiver type for accepted connections
    type Receiver: TransportReceiver;

    /// Accept a new connection, returning a description of the peer
    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, String)>;

    /// Close the server
    async fn close(&self) -> Result<()>;
}
