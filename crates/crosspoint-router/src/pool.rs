//! Outbound connection pool
//!
//! One connection per remote host, shared by every control routed to that
//! host. A connection nobody uses is kept open for a keep-alive period
//! before being closed; acquiring it again in the meantime cancels the
//! disposal. Map changes, lookups and timer cancellation share one lock.
//!
//! Each transport installed on a connection gets a new generation number.
//! Events carry the generation of the transport they came from, so a drop
//! is still reported after the connection has been reconnected.

use bytes::Bytes;
use crosspoint_core::{codec, Envelope, HostInfo, DEFAULT_DELIMITER};
use crosspoint_transport::{
    TransportConnector, TransportError, TransportEvent, TransportSender,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Result;

pub type ConnectionId = u64;

/// Transport generation within a connection, starting at 1
pub type Generation = u64;

/// Traffic and state changes of pooled connections
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// Raw bytes, not yet framed
    Data {
        connection: ConnectionId,
        generation: Generation,
        data: Bytes,
    },
    /// The transport of that generation went away
    Disconnected {
        connection: ConnectionId,
        generation: Generation,
    },
}

/// A shared outbound connection
pub struct PooledConnection {
    id: ConnectionId,
    host: HostInfo,
    sender: RwLock<Option<Arc<dyn TransportSender>>>,
    generation: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl PooledConnection {
    fn new(id: ConnectionId, host: HostInfo) -> Self {
        Self {
            id,
            host,
            sender: RwLock::new(None),
            generation: AtomicU64::new(0),
            reader: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    /// Generation of the most recently installed transport; 0 before the
    /// first connect
    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.sender
            .read()
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Queue raw bytes on the transport
    pub fn send(&self, data: Bytes) -> std::result::Result<(), TransportError> {
        match self.sender.read().as_ref() {
            Some(sender) => sender.try_send(data),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Encode and queue a framed envelope
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = codec::encode_frame(envelope, DEFAULT_DELIMITER)?;
        self.send(frame)?;
        Ok(())
    }

    /// Mark disposed. Returns false if it already was.
    fn retire(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }

    /// Stop reading and close the transport of a retired connection
    pub(crate) async fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let sender = self.sender.write().take();
        if let Some(sender) = sender {
            if let Err(e) = sender.close().await {
                debug!("Closing connection {} to {}: {}", self.id, self.host, e);
            }
        }
        debug!("Connection {} to {} disposed", self.id, self.host);
    }

    async fn dispose(&self) {
        if self.retire() {
            self.close().await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

struct PoolEntry {
    connection: Arc<PooledConnection>,
    pending_dispose: Option<(u64, JoinHandle<()>)>,
}

/// Host-keyed pool of outbound connections
pub struct ConnectionPool {
    connector: Arc<dyn TransportConnector>,
    entries: Mutex<HashMap<HostInfo, PoolEntry>>,
    events: mpsc::UnboundedSender<PoolEvent>,
    connect_timeout: Option<Duration>,
    next_id: AtomicU64,
    next_timer: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool. Traffic from every pooled connection is delivered on
    /// the returned receiver.
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        connect_timeout: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            connector,
            entries: Mutex::new(HashMap::new()),
            events,
            connect_timeout,
            next_id: AtomicU64::new(1),
            next_timer: AtomicU64::new(1),
        });
        (pool, rx)
    }

    /// Return the connection for `host`, connecting if needed. Cancels a
    /// pending disposal.
    pub async fn get_or_create(&self, host: &HostInfo) -> Result<Arc<PooledConnection>> {
        loop {
            let connection = self.acquire(host);
            match self.ensure_connected(&connection).await {
                Ok(()) => return Ok(connection),
                // Retired while connecting; the next pass takes a fresh entry
                Err(_) if connection.is_disposed() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn acquire(&self, host: &HostInfo) -> Arc<PooledConnection> {
        let mut entries = self.entries.lock();
        let stale = entries
            .get(host)
            .map(|e| e.connection.is_disposed())
            .unwrap_or(false);
        if stale {
            entries.remove(host);
        }
        let entry = entries.entry(host.clone()).or_insert_with(|| PoolEntry {
            connection: Arc::new(PooledConnection::new(
                self.next_id.fetch_add(1, Ordering::Relaxed),
                host.clone(),
            )),
            pending_dispose: None,
        });
        if let Some((_, timer)) = entry.pending_dispose.take() {
            timer.abort();
            debug!("Reusing connection to {}", host);
        }
        entry.connection.clone()
    }

    /// (Re)establish the transport of a pooled connection. A replaced
    /// transport keeps its reader, which still reports the drop.
    pub async fn ensure_connected(&self, connection: &Arc<PooledConnection>) -> Result<()> {
        let _guard = connection.connect_lock.lock().await;
        if connection.is_disposed() {
            return Err(TransportError::ConnectionClosed.into());
        }
        if connection.is_connected() {
            return Ok(());
        }

        debug!("Connecting to {}", connection.host);
        let connect = self.connector.connect(&connection.host);
        let (sender, mut receiver) = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => connect.await?,
        };

        // Serialized by connect_lock
        let generation = connection.generation() + 1;
        let installed = {
            let mut slot = connection.sender.write();
            if connection.is_disposed() {
                false
            } else {
                *slot = Some(sender.clone());
                connection.generation.store(generation, Ordering::SeqCst);
                true
            }
        };
        if !installed {
            if let Err(e) = sender.close().await {
                debug!("Closing late transport to {}: {}", connection.host, e);
            }
            return Err(TransportError::ConnectionClosed.into());
        }

        let events = self.events.clone();
        let id = connection.id;
        let host = connection.host.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    TransportEvent::Data(data) => {
                        let event = PoolEvent::Data {
                            connection: id,
                            generation,
                            data,
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    TransportEvent::Disconnected { reason } => {
                        warn!("Connection to {} lost: {:?}", host, reason);
                        break;
                    }
                    TransportEvent::Error(e) => {
                        warn!("Transport error on {}: {}", host, e);
                    }
                    TransportEvent::Connected => {}
                }
            }
            let _ = events.send(PoolEvent::Disconnected {
                connection: id,
                generation,
            });
        });

        // Dropping the previous handle detaches it; it ends after its drop event
        *connection.reader.lock() = Some(reader);
        info!("Connected to {} (generation {})", connection.host, generation);
        Ok(())
    }

    /// Close `connection` after `delay` unless it is acquired again first.
    /// A connection that is not in the pool is closed right away.
    pub fn schedule_dispose(self: &Arc<Self>, connection: &Arc<PooledConnection>, delay: Duration) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&connection.host) {
            Some(entry) if Arc::ptr_eq(&entry.connection, connection) => {
                if let Some((_, timer)) = entry.pending_dispose.take() {
                    timer.abort();
                }
                let ticket = self.next_timer.fetch_add(1, Ordering::Relaxed);
                let pool: Weak<Self> = Arc::downgrade(self);
                let host = connection.host.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(pool) = pool.upgrade() {
                        pool.dispose_if_current(&host, ticket).await;
                    }
                });
                entry.pending_dispose = Some((ticket, timer));
                debug!("Connection to {} idle, closing in {:?}", connection.host, delay);
            }
            _ => {
                if connection.retire() {
                    let connection = connection.clone();
                    tokio::spawn(async move { connection.close().await });
                }
            }
        }
    }

    /// Cancel a pending disposal. Returns true if one was pending.
    pub fn cancel_dispose(&self, connection: &Arc<PooledConnection>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&connection.host) {
            Some(entry) if Arc::ptr_eq(&entry.connection, connection) => {
                match entry.pending_dispose.take() {
                    Some((_, timer)) => {
                        timer.abort();
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Take `connection` out of the pool and mark it disposed. Returns true
    /// if the caller now owns closing it with [`PooledConnection::close`].
    pub(crate) fn detach(&self, connection: &Arc<PooledConnection>) -> bool {
        let mut entries = self.entries.lock();
        let owned = entries
            .get(&connection.host)
            .map(|e| Arc::ptr_eq(&e.connection, connection))
            .unwrap_or(false);
        if owned {
            if let Some(entry) = entries.remove(&connection.host) {
                if let Some((_, timer)) = entry.pending_dispose {
                    timer.abort();
                }
            }
        }
        connection.retire()
    }

    /// Remove and close a connection now
    pub async fn remove_immediate(&self, connection: &Arc<PooledConnection>) {
        if self.detach(connection) {
            connection.close().await;
        }
    }

    pub fn get(&self, host: &HostInfo) -> Option<Arc<PooledConnection>> {
        self.entries.lock().get(host).map(|e| e.connection.clone())
    }

    pub fn get_by_id(&self, id: ConnectionId) -> Option<Arc<PooledConnection>> {
        self.entries
            .lock()
            .values()
            .find(|e| e.connection.id == id)
            .map(|e| e.connection.clone())
    }

    pub fn contains(&self, host: &HostInfo) -> bool {
        self.entries.lock().contains_key(host)
    }

    pub fn is_dispose_pending(&self, host: &HostInfo) -> bool {
        self.entries
            .lock()
            .get(host)
            .map(|e| e.pending_dispose.is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        let drained: Vec<PoolEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            if let Some((_, timer)) = entry.pending_dispose {
                timer.abort();
            }
            entry.connection.dispose().await;
        }
    }

    async fn dispose_if_current(&self, host: &HostInfo, ticket: u64) {
        let connection = {
            let mut entries = self.entries.lock();
            let current = entries
                .get(host)
                .and_then(|e| e.pending_dispose.as_ref())
                .map(|(t, _)| *t == ticket)
                .unwrap_or(false);
            if !current {
                return;
            }
            // Retired under the pool lock so cancel_dispose callers see it
            entries
                .remove(host)
                .map(|e| e.connection)
                .filter(|c| c.retire())
        };

        if let Some(connection) = connection {
            info!("Closing idle connection to {}", host);
            connection.close().await;
        }
    }
}
