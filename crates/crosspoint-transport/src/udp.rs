//! UDP transport for discovery announcements

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};

/// UDP configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Maximum datagram size accepted
    pub max_packet_size: usize,
    /// Queue depth between the socket task and the consumer
    pub queue_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 65507, // Max UDP payload
            queue_size: 100,
        }
    }
}

/// A bound UDP socket
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    config: UdpConfig,
}

impl UdpEndpoint {
    /// Bind to a local address
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, UdpConfig::default()).await
    }

    /// Bind with config
    pub async fn bind_with_config(addr: &str, config: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        info!("UDP bound to {}", addr);

        Ok(Self {
            socket: Arc::new(socket),
            config,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Enable broadcast
    pub fn set_broadcast(&self, enable: bool) -> Result<()> {
        self.socket.set_broadcast(enable).map_err(TransportError::Io)
    }

    /// Send to a specific address
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Send to the limited broadcast address on a port
    pub async fn broadcast(&self, data: &[u8], port: u16) -> Result<()> {
        self.send_to(data, SocketAddr::from(([255, 255, 255, 255], port)))
            .await
    }

    /// Start receiving datagrams on a background task
    pub fn start_receiver(&self) -> UdpReceiver {
        let (tx, rx) = mpsc::channel(self.config.queue_size);
        let socket = self.socket.clone();
        let max_size = self.config.max_packet_size;

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; max_size];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        debug!("UDP received {} bytes from {}", len, from);
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        if tx.send((data, from)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // ICMP errors surface here on some platforms; keep listening
                        error!("UDP receive error: {}", e);
                    }
                }
            }
        });

        UdpReceiver { rx, task }
    }
}

/// Datagrams received by an [`UdpEndpoint`]
pub struct UdpReceiver {
    rx: mpsc::Receiver<(Bytes, SocketAddr)>,
    task: JoinHandle<()>,
}

impl UdpReceiver {
    /// Receive the next datagram with its source address
    pub async fn recv_from(&mut self) -> Option<(Bytes, SocketAddr)> {
        self.rx.recv().await
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}
