//! TCP transport implementation
//!
//! Raw TCP byte stream. Message boundaries are not preserved here: the
//! consumer runs delimiter framing over the delivered chunks.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use crosspoint_core::HostInfo;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::traits::{
    Connection, TransportConnector, TransportEvent, TransportReceiver, TransportSender,
    TransportServer,
};

/// Default channel buffer size for TCP connections
const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// TCP configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Read buffer size
    pub read_buffer_size: usize,
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
    /// Outbound queue depth per connection
    pub send_queue_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            keepalive_secs: 30,
            send_queue_size: DEFAULT_CHANNEL_BUFFER_SIZE,
        }
    }
}

/// TCP transport (outbound connector)
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            config: TcpConfig::default(),
        }
    }

    pub fn with_config(config: TcpConfig) -> Self {
        Self { config }
    }

    /// Connect to a TCP server
    pub async fn connect_addr(&self, addr: &str) -> Result<(TcpSender, TcpReceiver)> {
        debug!("Connecting to TCP: {}", addr);

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let pair = spawn_connection(stream, &self.config);
        info!("TCP connected to {}", addr);
        Ok(pair)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportConnector for TcpTransport {
    async fn connect(&self, host: &HostInfo) -> Result<Connection> {
        let (sender, receiver) = self.connect_addr(&host.to_string()).await?;
        Ok((Arc::new(sender), Box::new(receiver)))
    }
}

fn spawn_connection(stream: TcpStream, config: &TcpConfig) -> (TcpSender, TcpReceiver) {
    if config.keepalive_secs > 0 {
        let socket = socket2::SockRef::from(&stream);
        let keepalive =
            socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        let _ = socket.set_tcp_keepalive(&keepalive);
    }
    let _ = stream.set_nodelay(true);

    let connected = Arc::new(Mutex::new(true));
    let shutdown = Arc::new(Notify::new());
    let (outgoing_tx, outgoing_rx) = mpsc::channel::<Bytes>(config.send_queue_size);
    let (incoming_tx, incoming_rx) = mpsc::channel::<TransportEvent>(DEFAULT_CHANNEL_BUFFER_SIZE);

    let sender = TcpSender {
        tx: outgoing_tx,
        connected: connected.clone(),
        shutdown: shutdown.clone(),
    };
    let receiver = TcpReceiver { rx: incoming_rx };

    let read_buffer_size = config.read_buffer_size;
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        run_tcp_io_loop(
            reader,
            writer,
            outgoing_rx,
            incoming_tx,
            read_buffer_size,
            connected,
            shutdown,
        )
        .await;
    });

    (sender, receiver)
}

/// Shared IO loop for TCP connections. One task per connection drains the
/// outbound queue, so send order is preserved.
async fn run_tcp_io_loop(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut outgoing_rx: mpsc::Receiver<Bytes>,
    incoming_tx: mpsc::Sender<TransportEvent>,
    read_buffer_size: usize,
    connected: Arc<Mutex<bool>>,
    shutdown: Arc<Notify>,
) {
    let mut read_buf = BytesMut::with_capacity(read_buffer_size);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("TCP connection closed locally");
                let _ = writer.shutdown().await;
                break;
            }

            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            error!("TCP write error: {}", e);
                            *connected.lock() = false;
                            let _ = incoming_tx.send(TransportEvent::Disconnected {
                                reason: Some(e.to_string()),
                            }).await;
                            break;
                        }
                    }
                    None => {
                        // All senders dropped
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }

            result = reader.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        debug!("TCP connection closed");
                        *connected.lock() = false;
                        let _ = incoming_tx.send(TransportEvent::Disconnected { reason: None }).await;
                        break;
                    }
                    Ok(_) => {
                        let data = read_buf.split().freeze();
                        if incoming_tx.send(TransportEvent::Data(data)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("TCP read error: {}", e);
                        *connected.lock() = false;
                        let _ = incoming_tx.send(TransportEvent::Disconnected {
                            reason: Some(e.to_string()),
                        }).await;
                        break;
                    }
                }
            }
        }
    }

    *connected.lock() = false;
}

/// TCP sender for writing bytes
pub struct TcpSender {
    tx: mpsc::Sender<Bytes>,
    connected: Arc<Mutex<bool>>,
    shutdown: Arc<Notify>,
}

#[async_trait]
impl TransportSender for TcpSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !*self.connected.lock() {
            return Err(TransportError::NotConnected);
        }

        self.tx
            .send(data)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".into()))
    }

    fn try_send(&self, data: Bytes) -> Result<()> {
        if !*self.connected.lock() {
            return Err(TransportError::NotConnected);
        }

        self.tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock() && !self.tx.is_closed()
    }

    async fn close(&self) -> Result<()> {
        *self.connected.lock() = false;
        self.shutdown.notify_one();
        Ok(())
    }
}

/// TCP receiver for reading raw chunks
pub struct TcpReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for TcpReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// TCP server for accepting connections
pub struct TcpServer {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpServer {
    /// Bind to an address and create a new TCP server
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, TcpConfig::default()).await
    }

    /// Bind with custom configuration
    pub async fn bind_with_config(addr: &str, config: TcpConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        info!("TCP server listening on {}", addr);

        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::Io)
    }
}

#[async_trait]
impl TransportServer for TcpServer {
    type Sender = TcpSender;
    type Receiver = TcpReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, String)> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::AcceptFailed(e.to_string()))?;

        debug!("TCP connection accepted from {}", peer_addr);

        let (sender, receiver) = spawn_connection(stream, &self.config);
        Ok((sender, receiver, peer_addr.to_string()))
    }

    async fn close(&self) -> Result<()> {
        // TcpListener closes when dropped
        Ok(())
    }
}
