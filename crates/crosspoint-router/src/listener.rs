//! Shared listening sockets
//!
//! Several equipment registries may serve the same port. The
//! [`ListenerPool`] keeps one [`SharedListener`] per port, counting the
//! registries using it; the listener stops when the last
//! [`ListenerLease`] is dropped.

use bytes::Bytes;
use crosspoint_core::{codec, DelimiterFramer, Envelope, MessageType, DEFAULT_DELIMITER};
use crosspoint_transport::{
    TransportError, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Result;

/// Accepted client connection, unique across all listeners
pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Receives traffic from clients of a shared listener
pub trait ConnectionHandler: Send + Sync {
    /// Handle an envelope. Returns false if this handler does not host the
    /// addressed equipment.
    fn on_client_envelope(
        &self,
        listener: &Arc<SharedListener>,
        client: ClientId,
        envelope: &Envelope,
    ) -> bool;

    fn on_client_disconnected(&self, client: ClientId);
}

struct HandlerSlot {
    token: u64,
    handler: Weak<dyn ConnectionHandler>,
}

/// One accepting socket and its clients
pub struct SharedListener {
    port: u16,
    clients: DashMap<ClientId, Arc<dyn TransportSender>>,
    client_tasks: Mutex<HashMap<ClientId, JoinHandle<()>>>,
    handlers: Mutex<Vec<HandlerSlot>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SharedListener {
    fn new(port: u16) -> Self {
        Self {
            port,
            clients: DashMap::new(),
            client_tasks: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            accept_task: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queue raw bytes to a client
    pub fn send(&self, client: ClientId, data: Bytes) -> std::result::Result<(), TransportError> {
        let sender = self.clients.get(&client).map(|s| s.value().clone());
        match sender {
            Some(sender) => sender.try_send(data),
            None => Err(TransportError::NotConnected),
        }
    }

    pub fn send_envelope(&self, client: ClientId, envelope: &Envelope) -> Result<()> {
        let frame = codec::encode_frame(envelope, DEFAULT_DELIMITER)?;
        self.send(client, frame)?;
        Ok(())
    }

    fn handlers(&self) -> Vec<Arc<dyn ConnectionHandler>> {
        self.handlers
            .lock()
            .iter()
            .filter_map(|slot| slot.handler.upgrade())
            .collect()
    }

    fn start<S>(self: &Arc<Self>, mut server: S)
    where
        S: TransportServer + 'static,
        S::Sender: 'static,
        S::Receiver: 'static,
    {
        let listener = Arc::downgrade(self);
        let port = self.port;
        let task = tokio::spawn(async move {
            info!("Accepting crosspoint connections on port {}", port);
            loop {
                match server.accept().await {
                    Ok((sender, receiver, peer)) => {
                        let Some(listener) = listener.upgrade() else {
                            break;
                        };
                        listener.handle_client(Arc::new(sender), receiver, peer);
                    }
                    Err(e) => {
                        error!("Accept error on port {}: {}", port, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);
    }

    fn handle_client(
        self: &Arc<Self>,
        sender: Arc<dyn TransportSender>,
        mut receiver: impl TransportReceiver + 'static,
        peer: String,
    ) {
        let client = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(client, sender);
        debug!("Client {} connected from {}", client, peer);

        let listener = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut framer = DelimiterFramer::default();

            while let Some(event) = receiver.recv().await {
                match event {
                    TransportEvent::Data(data) => {
                        let Some(listener) = listener.upgrade() else {
                            return;
                        };
                        framer.push(&data);
                        loop {
                            match framer.next_frame() {
                                Ok(Some(frame)) => match codec::decode(&frame) {
                                    Ok(envelope) => listener.dispatch(client, envelope),
                                    Err(e) => warn!("Decode error from {}: {}", peer, e),
                                },
                                Ok(None) => break,
                                Err(e) => warn!("Framing error from {}: {}", peer, e),
                            }
                        }
                    }
                    TransportEvent::Disconnected { reason } => {
                        debug!("Client {} disconnected: {:?}", client, reason);
                        break;
                    }
                    TransportEvent::Error(e) => {
                        error!("Transport error from {}: {}", peer, e);
                        break;
                    }
                    TransportEvent::Connected => {}
                }
            }

            if let Some(listener) = listener.upgrade() {
                listener.client_closed(client);
            }
        });
        self.client_tasks.lock().insert(client, task);
    }

    fn dispatch(self: &Arc<Self>, client: ClientId, envelope: Envelope) {
        match envelope.message_type {
            MessageType::Ping => {
                if let Err(e) = self.send_envelope(client, &Envelope::pong()) {
                    debug!("Pong to client {} failed: {}", client, e);
                }
                return;
            }
            MessageType::Pong => return,
            _ => {}
        }

        let handled = self
            .handlers()
            .iter()
            .fold(false, |handled, h| h.on_client_envelope(self, client, &envelope) || handled);

        if !handled {
            if envelope.message_type == MessageType::ControlConnect {
                warn!(
                    "Control connect for unknown equipment {}",
                    envelope.equipment_id
                );
                let reply =
                    Envelope::equipment_disconnect(envelope.equipment_id, envelope.control_ids);
                let _ = self.send_envelope(client, &reply);
            } else {
                debug!(
                    "Dropping {:?} for unknown equipment {}",
                    envelope.message_type, envelope.equipment_id
                );
            }
        }
    }

    fn client_closed(&self, client: ClientId) {
        self.clients.remove(&client);
        self.client_tasks.lock().remove(&client);
        for handler in self.handlers() {
            handler.on_client_disconnected(client);
        }
    }

    fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        for (_, task) in self.client_tasks.lock().drain() {
            task.abort();
        }
        // Dropping the senders closes the connections
        self.clients.clear();
        info!("Stopped listening on port {}", self.port);
    }
}

struct PoolSlot {
    listener: Arc<SharedListener>,
    refs: usize,
}

/// Port-keyed, reference counted listeners
#[derive(Default)]
pub struct ListenerPool {
    slots: Mutex<HashMap<u16, PoolSlot>>,
    next_token: AtomicU64,
}

impl ListenerPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the listener on `port`, creating it with `bind` if this is the
    /// first user.
    pub async fn acquire<S, F, Fut>(
        self: &Arc<Self>,
        port: u16,
        handler: Weak<dyn ConnectionHandler>,
        bind: F,
    ) -> Result<ListenerLease>
    where
        S: TransportServer + 'static,
        S::Sender: 'static,
        S::Receiver: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<S, TransportError>>,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        if let Some(lease) = self.join_existing(port, token, &handler) {
            return Ok(lease);
        }

        let server = bind().await?;

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&port) {
            // Lost a bind race; the other listener wins and ours is dropped
            slot.refs += 1;
            slot.listener.handlers.lock().push(HandlerSlot { token, handler });
            return Ok(self.lease(port, token, slot.listener.clone()));
        }

        let listener = Arc::new(SharedListener::new(port));
        listener.handlers.lock().push(HandlerSlot { token, handler });
        listener.start(server);
        slots.insert(
            port,
            PoolSlot {
                listener: listener.clone(),
                refs: 1,
            },
        );
        Ok(self.lease(port, token, listener))
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.slots.lock().contains_key(&port)
    }

    pub fn ref_count(&self, port: u16) -> usize {
        self.slots.lock().get(&port).map(|s| s.refs).unwrap_or(0)
    }

    fn join_existing(
        self: &Arc<Self>,
        port: u16,
        token: u64,
        handler: &Weak<dyn ConnectionHandler>,
    ) -> Option<ListenerLease> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&port)?;
        slot.refs += 1;
        slot.listener.handlers.lock().push(HandlerSlot {
            token,
            handler: handler.clone(),
        });
        debug!("Sharing listener on port {} ({} users)", port, slot.refs);
        Some(self.lease(port, token, slot.listener.clone()))
    }

    fn lease(self: &Arc<Self>, port: u16, token: u64, listener: Arc<SharedListener>) -> ListenerLease {
        ListenerLease {
            pool: Arc::downgrade(self),
            port,
            token,
            listener,
        }
    }

    fn release(&self, port: u16, token: u64) {
        let stopped = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&port) else {
                return;
            };
            slot.listener.handlers.lock().retain(|h| h.token != token);
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 {
                slots.remove(&port).map(|s| s.listener)
            } else {
                None
            }
        };

        if let Some(listener) = stopped {
            listener.stop();
        }
    }
}

/// Use of a shared listener; released on drop
pub struct ListenerLease {
    pool: Weak<ListenerPool>,
    port: u16,
    token: u64,
    listener: Arc<SharedListener>,
}

impl ListenerLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn listener(&self) -> &Arc<SharedListener> {
        &self.listener
    }
}

impl Drop for ListenerLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.port, self.token);
        }
    }
}
