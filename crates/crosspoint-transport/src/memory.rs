//! In-process transport
//!
//! A [`MemoryNetwork`] is a registry of named listen addresses. Connections
//! made through a [`MemoryConnector`] behave like the TCP transport (raw
//! byte chunks, ordered delivery, `Disconnected` on either side closing)
//! without touching the OS. Tests use [`MemoryNetwork::set_refusing`] and
//! [`MemoryNetwork::sever`] to inject connect failures and drops.

use async_trait::async_trait;
use bytes::Bytes;
use crosspoint_core::HostInfo;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{
    Connection, TransportConnector, TransportEvent, TransportReceiver, TransportSender,
    TransportServer,
};

type Accepted = (MemorySender, MemoryReceiver, String);

struct Listener {
    token: u64,
    tx: mpsc::UnboundedSender<Accepted>,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<String, Listener>,
    refusing: HashSet<String>,
    links: HashMap<String, Vec<Weak<Link>>>,
}

/// Shared state of one connection; both halves point at it
struct Link {
    connected: AtomicBool,
    ends: [mpsc::UnboundedSender<TransportEvent>; 2],
}

impl Link {
    fn shut(&self, reason: Option<String>) {
        if self.connected.swap(false, Ordering::SeqCst) {
            for end in &self.ends {
                let _ = end.send(TransportEvent::Disconnected {
                    reason: reason.clone(),
                });
            }
        }
    }
}

/// In-process network of named listen addresses
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
    next_token: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start listening on `addr` (any string, usually `host:port`)
    pub fn bind(self: &Arc<Self>, addr: impl Into<String>) -> Result<MemoryServer> {
        let addr = addr.into();
        let mut state = self.state.lock();
        if state.listeners.contains_key(&addr) {
            return Err(TransportError::BindFailed(format!(
                "address in use: {}",
                addr
            )));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(addr.clone(), Listener { token, tx });
        info!("Memory server listening on {}", addr);

        Ok(MemoryServer {
            network: self.clone(),
            addr,
            token,
            rx,
        })
    }

    /// Outbound connector on this network
    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    /// Make connects to `addr` fail (or succeed again)
    pub fn set_refusing(&self, addr: impl Into<String>, refusing: bool) {
        let addr = addr.into();
        let mut state = self.state.lock();
        if refusing {
            state.refusing.insert(addr);
        } else {
            state.refusing.remove(&addr);
        }
    }

    /// Drop every live connection to `addr`; both ends see `Disconnected`
    pub fn sever(&self, addr: &str) -> usize {
        let links: Vec<Arc<Link>> = {
            let mut state = self.state.lock();
            state
                .links
                .remove(addr)
                .unwrap_or_default()
                .iter()
                .filter_map(Weak::upgrade)
                .collect()
        };

        let mut severed = 0;
        for link in links {
            if link.connected.load(Ordering::SeqCst) {
                link.shut(Some("severed".to_string()));
                severed += 1;
            }
        }
        debug!("Severed {} memory connections to {}", severed, addr);
        severed
    }

    /// Number of open connections to `addr`
    pub fn live_connections(&self, addr: &str) -> usize {
        let state = self.state.lock();
        state
            .links
            .get(addr)
            .map(|links| {
                links
                    .iter()
                    .filter_map(Weak::upgrade)
                    .filter(|l| l.connected.load(Ordering::SeqCst))
                    .count()
            })
            .unwrap_or(0)
    }

    fn connect_addr(&self, addr: &str) -> Result<(MemorySender, MemoryReceiver)> {
        let mut state = self.state.lock();

        if state.refusing.contains(addr) {
            return Err(TransportError::ConnectionFailed(format!(
                "connection refused: {}",
                addr
            )));
        }
        let listener_tx = match state.listeners.get(addr) {
            Some(listener) => listener.tx.clone(),
            None => {
                return Err(TransportError::ConnectionFailed(format!(
                    "no listener at {}",
                    addr
                )))
            }
        };

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            connected: AtomicBool::new(true),
            ends: [client_tx.clone(), server_tx.clone()],
        });

        let client = (
            MemorySender {
                peer: server_tx,
                link: link.clone(),
            },
            MemoryReceiver::new(client_rx),
        );
        let server = (
            MemorySender {
                peer: client_tx,
                link: link.clone(),
            },
            MemoryReceiver::new(server_rx),
            format!("memory-client@{}", addr),
        );

        if listener_tx.send(server).is_err() {
            return Err(TransportError::ConnectionFailed(format!(
                "listener at {} is gone",
                addr
            )));
        }

        let links = state.links.entry(addr.to_string()).or_default();
        links.retain(|l| l.strong_count() > 0);
        links.push(Arc::downgrade(&link));

        debug!("Memory connection opened to {}", addr);
        Ok(client)
    }

    fn unbind(&self, addr: &str, token: u64) {
        let mut state = self.state.lock();
        if state.listeners.get(addr).map(|l| l.token) == Some(token) {
            state.listeners.remove(addr);
            debug!("Memory server on {} closed", addr);
        }
    }
}

/// Sending half of a memory connection
pub struct MemorySender {
    peer: mpsc::UnboundedSender<TransportEvent>,
    link: Arc<Link>,
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.try_send(data)
    }

    fn try_send(&self, data: Bytes) -> Result<()> {
        if !self.link.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.peer
            .send(TransportEvent::Data(data))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.link.shut(None);
        Ok(())
    }
}

impl Drop for MemorySender {
    fn drop(&mut self) {
        self.link.shut(None);
    }
}

/// Receiving half of a memory connection. Ends after `Disconnected`.
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    done: bool,
}

impl MemoryReceiver {
    fn new(rx: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self { rx, done: false }
    }
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await;
        if matches!(event, None | Some(TransportEvent::Disconnected { .. })) {
            self.done = true;
        }
        event
    }
}

/// Listening side on a [`MemoryNetwork`]. The address is released on drop.
pub struct MemoryServer {
    network: Arc<MemoryNetwork>,
    addr: String,
    token: u64,
    rx: mpsc::UnboundedReceiver<Accepted>,
}

impl MemoryServer {
    pub fn local_addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl TransportServer for MemoryServer {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, String)> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransportError::AcceptFailed("listener closed".into()))
    }

    async fn close(&self) -> Result<()> {
        self.network.unbind(&self.addr, self.token);
        Ok(())
    }
}

impl Drop for MemoryServer {
    fn drop(&mut self) {
        self.network.unbind(&self.addr, self.token);
    }
}

/// Outbound connector for a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, host: &HostInfo) -> Result<Connection> {
        let (sender, receiver) = self.network.connect_addr(&host.to_string())?;
        Ok((Arc::new(sender), Box::new(receiver)))
    }
}
