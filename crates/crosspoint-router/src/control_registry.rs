//! Control side registry
//!
//! Routes local control crosspoints to remote equipment. Equipment ids are
//! resolved through the discovery tracker, connections come from the pool,
//! and inbound traffic is delivered only to controls currently routed to
//! the sending equipment over that same connection.
//!
//! Whether a connection is still in use is decided under the routes lock,
//! and disposal is scheduled or cancelled before that lock is released.
//! Lock order is routes, then pool.

use async_trait::async_trait;
use crosspoint_core::{
    codec, ConnectionStatus, CrosspointId, DelimiterFramer, Envelope, MessageType,
};
use crosspoint_discovery::RemoteCrosspointTracker;
use crosspoint_transport::TransportConnector;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ControlRegistryConfig;
use crate::crosspoint::{
    ConnectionRequester, ControlCrosspoint, ControlLink, Crosspoint, InputSink,
};
use crate::pool::{ConnectionId, ConnectionPool, Generation, PoolEvent, PooledConnection};
use crate::registry::CrosspointRegistry;
use crate::Result;

type Routes = HashMap<CrosspointId, Route>;

/// An established control → equipment route
#[derive(Clone)]
struct Route {
    connection: Arc<PooledConnection>,
    equipment_id: CrosspointId,
    /// Transport generation the handshake went out on
    generation: Generation,
}

struct ControlInner {
    registry: CrosspointRegistry<ControlCrosspoint>,
    tracker: Arc<RemoteCrosspointTracker>,
    pool: Arc<ConnectionPool>,
    routes: Mutex<Routes>,
    config: ControlRegistryConfig,
}

impl ControlInner {
    fn route(&self, control_id: CrosspointId) -> Option<Route> {
        self.routes.lock().get(&control_id).cloned()
    }

    fn is_referenced(routes: &Routes, connection: &Arc<PooledConnection>) -> bool {
        routes
            .values()
            .any(|r| Arc::ptr_eq(&r.connection, connection))
    }

    /// Start the keep-alive countdown of a connection nobody routes over.
    /// Called with the routes lock held.
    fn idle_if_unused(&self, routes: &Routes, connection: &Arc<PooledConnection>) {
        if !Self::is_referenced(routes, connection) {
            self.pool.schedule_dispose(connection, self.config.keep_alive());
        }
    }

    /// Detach a connection nobody routes over. Called with the routes lock
    /// held; returns true if the caller must close it afterwards.
    fn detach_if_unused(&self, routes: &Routes, connection: &Arc<PooledConnection>) -> bool {
        !Self::is_referenced(routes, connection) && self.pool.detach(connection)
    }

    fn connection_by_id(&self, connection: ConnectionId) -> Option<Arc<PooledConnection>> {
        self.routes
            .lock()
            .values()
            .find(|r| r.connection.id() == connection)
            .map(|r| r.connection.clone())
            .or_else(|| self.pool.get_by_id(connection))
    }

    /// Leave a route behind after its connection failed or the remote ended it
    fn end_route(&self, control_id: CrosspointId, status: ConnectionStatus) {
        if let Some(control) = self.registry.try_get(control_id) {
            control.unbind_equipment();
            control.set_status(status);
        }
    }

    fn handle_envelope(&self, connection: ConnectionId, envelope: Envelope) {
        match envelope.message_type {
            MessageType::Ping => {
                if let Some(conn) = self.pool.get_by_id(connection) {
                    let _ = conn.send_envelope(&Envelope::pong());
                }
            }
            MessageType::Pong => {}
            MessageType::EquipmentDisconnect => self.remote_disconnect(connection, &envelope),
            _ => self.deliver(connection, envelope),
        }
    }

    fn remote_disconnect(&self, connection: ConnectionId, envelope: &Envelope) {
        let mut ended = Vec::new();
        {
            let mut routes = self.routes.lock();
            for &control in &envelope.control_ids {
                let matches = routes
                    .get(&control)
                    .map(|r| r.equipment_id == envelope.equipment_id && r.connection.id() == connection)
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
                if let Some(route) = routes.remove(&control) {
                    self.idle_if_unused(&routes, &route.connection);
                    ended.push(control);
                }
            }
        }

        for control in ended {
            warn!(
                "Equipment {} closed the route of control {}",
                envelope.equipment_id, control
            );
            self.end_route(control, ConnectionStatus::ConnectionClosedRemote);
        }
    }

    fn deliver(&self, connection: ConnectionId, envelope: Envelope) {
        let recipients: Vec<CrosspointId> = {
            let routes = self.routes.lock();
            envelope
                .control_ids
                .iter()
                .copied()
                .filter(|c| {
                    routes
                        .get(c)
                        .map(|r| {
                            r.equipment_id == envelope.equipment_id
                                && r.connection.id() == connection
                        })
                        .unwrap_or(false)
                })
                .collect()
        };

        if recipients.is_empty() {
            debug!(
                "Dropping {:?} from equipment {} for unrouted controls {:?}",
                envelope.message_type, envelope.equipment_id, envelope.control_ids
            );
            return;
        }
        for control in recipients {
            self.registry
                .send_to_crosspoint(control, envelope.for_controls(vec![control]));
        }
    }

    /// Routes over `connection` whose handshake went out on `generation`
    /// or earlier, as `(control, equipment)`
    fn stale_routes(
        routes: &Routes,
        connection: &Arc<PooledConnection>,
        generation: Generation,
    ) -> Vec<(CrosspointId, CrosspointId)> {
        let mut stale: Vec<(CrosspointId, CrosspointId)> = routes
            .iter()
            .filter(|(_, r)| Arc::ptr_eq(&r.connection, connection) && r.generation <= generation)
            .map(|(c, r)| (*c, r.equipment_id))
            .collect();
        stale.sort_unstable();
        stale
    }

    /// The transport of `generation` dropped. Routes set up over it are
    /// re-handshaken on the current transport or dropped, even if another
    /// control already reconnected the connection.
    async fn handle_connection_lost(&self, connection: ConnectionId, generation: Generation) {
        let Some(conn) = self.connection_by_id(connection) else {
            return;
        };
        if Self::stale_routes(&self.routes.lock(), &conn, generation).is_empty() {
            return;
        }

        if self.config.auto_reconnect && !conn.is_disposed() {
            info!("Reconnecting to {}", conn.host());
            match self.pool.ensure_connected(&conn).await {
                Ok(()) => {
                    let current = conn.generation();
                    let rehandshake = {
                        let mut routes = self.routes.lock();
                        let stale = Self::stale_routes(&routes, &conn, generation);
                        for (control, _) in &stale {
                            if let Some(route) = routes.get_mut(control) {
                                route.generation = current;
                            }
                        }
                        stale
                    };
                    for (control_id, equipment_id) in rehandshake {
                        if let Some(control) = self.registry.try_get(control_id) {
                            control.defer_clear();
                        }
                        if let Err(e) =
                            conn.send_envelope(&Envelope::control_connect(equipment_id, control_id))
                        {
                            warn!("Re-handshake of control {} failed: {}", control_id, e);
                        }
                    }
                    return;
                }
                Err(e) => warn!("Reconnect to {} failed: {}", conn.host(), e),
            }
        }

        let (dropped, close) = {
            let mut routes = self.routes.lock();
            let stale = Self::stale_routes(&routes, &conn, generation);
            for (control, _) in &stale {
                routes.remove(control);
            }
            let close = if conn.is_connected() {
                // A newer transport is up; it closes like any idle connection
                self.idle_if_unused(&routes, &conn);
                false
            } else {
                self.detach_if_unused(&routes, &conn)
            };
            (stale, close)
        };
        if close {
            conn.close().await;
        }
        for (control, _) in dropped {
            warn!("Control {} lost its connection to {}", control, conn.host());
            self.end_route(control, ConnectionStatus::ConnectionDropped);
        }
    }

    /// Drop a connection nobody routes over after a failed connect
    async fn discard_if_unused(&self, connection: &Arc<PooledConnection>) {
        let close = self.detach_if_unused(&self.routes.lock(), connection);
        if close {
            connection.close().await;
        }
    }

    async fn connect(&self, control: &ControlCrosspoint, equipment_id: CrosspointId) -> ConnectionStatus {
        let control_id = control.id();
        let current = self.route(control_id);

        if let Some(route) = &current {
            if route.equipment_id == equipment_id && control.status().is_connected() {
                return ConnectionStatus::Connected;
            }
        }
        if control.status().is_failure() {
            control.set_status(ConnectionStatus::Idle);
        }

        let Some(info) = self.tracker.try_get(equipment_id) else {
            warn!("Equipment {} is unknown, control {} stays put", equipment_id, control_id);
            if current.is_none() {
                control.set_status(ConnectionStatus::EquipmentNotFound);
            }
            return ConnectionStatus::EquipmentNotFound;
        };

        let host = info.host_info();
        let connection = match self.pool.get_or_create(&host).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Connect to {} for control {} failed: {}", host, control_id, e);
                if let Some(stale) = self.pool.get(&host) {
                    self.discard_if_unused(&stale).await;
                }
                if current.is_none() {
                    control.set_status(ConnectionStatus::ConnectFailed);
                }
                return ConnectionStatus::ConnectFailed;
            }
        };

        // Swap routes in one step: the new connection is claimed before the
        // old one can be found idle
        let old = {
            let mut routes = self.routes.lock();
            self.pool.cancel_dispose(&connection);
            if connection.is_disposed() {
                None
            } else {
                let old = routes.remove(&control_id);
                routes.insert(
                    control_id,
                    Route {
                        connection: connection.clone(),
                        equipment_id,
                        generation: connection.generation(),
                    },
                );
                if let Some(old) = &old {
                    if !Arc::ptr_eq(&old.connection, &connection) {
                        self.idle_if_unused(&routes, &old.connection);
                    }
                }
                Some(old)
            }
        };
        let Some(old) = old else {
            warn!("Connection to {} closed before control {} was routed", host, control_id);
            if current.is_none() {
                control.set_status(ConnectionStatus::ConnectFailed);
            }
            return ConnectionStatus::ConnectFailed;
        };

        // Leave the old equipment before joining the new one
        if let Some(old) = old {
            let _ = old
                .connection
                .send_envelope(&Envelope::control_disconnect(old.equipment_id, control_id));
        }
        control.bind_equipment(equipment_id);
        // Before the handshake, so a fast remote close lands after it
        control.set_status(ConnectionStatus::Connected);

        if let Err(e) = connection.send_envelope(&Envelope::control_connect(equipment_id, control_id)) {
            warn!("Handshake with equipment {} failed: {}", equipment_id, e);
            let close = {
                let mut routes = self.routes.lock();
                let ours = routes
                    .get(&control_id)
                    .map(|r| Arc::ptr_eq(&r.connection, &connection))
                    .unwrap_or(false);
                if ours {
                    routes.remove(&control_id);
                }
                self.detach_if_unused(&routes, &connection)
            };
            if close {
                connection.close().await;
            }
            control.unbind_equipment();
            control.set_status(ConnectionStatus::ConnectFailed);
            return ConnectionStatus::ConnectFailed;
        }

        info!(
            "Control {} routed to equipment {} at {}",
            control_id, equipment_id, host
        );
        ConnectionStatus::Connected
    }

    async fn disconnect(&self, control: &ControlCrosspoint) -> ConnectionStatus {
        let control_id = control.id();
        let route = {
            let mut routes = self.routes.lock();
            let route = routes.remove(&control_id);
            if let Some(route) = &route {
                self.idle_if_unused(&routes, &route.connection);
            }
            route
        };
        let Some(route) = route else {
            debug!("Control {} has no route to disconnect", control_id);
            return ConnectionStatus::Idle;
        };

        if let Err(e) = route
            .connection
            .send_envelope(&Envelope::control_disconnect(route.equipment_id, control_id))
        {
            debug!("Disconnect notice for control {} not sent: {}", control_id, e);
        }

        control.unbind_equipment();
        control.set_status(ConnectionStatus::Idle);
        info!(
            "Control {} disconnected from equipment {}",
            control_id, route.equipment_id
        );
        ConnectionStatus::Idle
    }
}

#[async_trait]
impl ConnectionRequester for ControlInner {
    async fn request_connect(
        &self,
        control_id: CrosspointId,
        equipment_id: CrosspointId,
    ) -> ConnectionStatus {
        let Some(control) = self.registry.try_get(control_id) else {
            return ConnectionStatus::ControlNotFound;
        };
        if equipment_id == 0 {
            return self.disconnect(&control).await;
        }
        self.connect(&control, equipment_id).await
    }

    async fn request_disconnect(&self, control_id: CrosspointId) -> ConnectionStatus {
        match self.registry.try_get(control_id) {
            Some(control) => self.disconnect(&control).await,
            None => ConnectionStatus::ControlNotFound,
        }
    }
}

impl InputSink<ControlCrosspoint> for ControlInner {
    fn on_crosspoint_input(&self, control: &ControlCrosspoint, envelope: Envelope) {
        let Some(route) = self.route(control.id()) else {
            debug!("Control {} has no route, dropping input", control.id());
            return;
        };
        if let Err(e) = route.connection.send_envelope(&envelope) {
            warn!(
                "Send from control {} to {} failed: {}",
                control.id(),
                route.connection.host(),
                e
            );
        }
    }
}

/// Frame and dispatch traffic from every pooled connection
async fn run_dispatcher(inner: Weak<ControlInner>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
    let mut framers: HashMap<(ConnectionId, Generation), DelimiterFramer> = HashMap::new();

    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            PoolEvent::Data {
                connection,
                generation,
                data,
            } => {
                let framer = framers.entry((connection, generation)).or_default();
                framer.push(&data);
                loop {
                    match framer.next_frame() {
                        Ok(Some(frame)) => match codec::decode(&frame) {
                            Ok(envelope) => inner.handle_envelope(connection, envelope),
                            Err(e) => warn!("Decode error on connection {}: {}", connection, e),
                        },
                        Ok(None) => break,
                        Err(e) => warn!("Framing error on connection {}: {}", connection, e),
                    }
                }
            }
            PoolEvent::Disconnected {
                connection,
                generation,
            } => {
                framers.remove(&(connection, generation));
                tokio::spawn(async move {
                    inner.handle_connection_lost(connection, generation).await;
                });
            }
        }
    }
}

/// Registry of local controls routed to remote equipment
pub struct ControlRegistry {
    inner: Arc<ControlInner>,
    dispatcher: JoinHandle<()>,
}

impl ControlRegistry {
    /// Create a registry resolving equipment through `tracker` and
    /// connecting with `connector`. Must be called inside a Tokio runtime.
    pub fn new(
        config: ControlRegistryConfig,
        tracker: Arc<RemoteCrosspointTracker>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let timeout = (config.handshake_timeout_ms > 0).then(|| config.handshake_timeout());
        let (pool, events) = ConnectionPool::new(connector, timeout);

        let inner = Arc::new_cyclic(|weak: &Weak<ControlInner>| {
            let sink: Weak<dyn InputSink<ControlCrosspoint>> = weak.clone();
            let requester: Weak<dyn ConnectionRequester> = weak.clone();
            ControlInner {
                registry: CrosspointRegistry::new(ControlLink { sink, requester }),
                tracker,
                pool,
                routes: Mutex::new(HashMap::new()),
                config,
            }
        });
        let dispatcher = tokio::spawn(run_dispatcher(Arc::downgrade(&inner), events));

        Self { inner, dispatcher }
    }

    /// Registry connecting over TCP
    #[cfg(feature = "tcp")]
    pub fn tcp(config: ControlRegistryConfig, tracker: Arc<RemoteCrosspointTracker>) -> Self {
        Self::new(
            config,
            tracker,
            Arc::new(crosspoint_transport::TcpTransport::new()),
        )
    }

    pub fn config(&self) -> &ControlRegistryConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CrosspointRegistry<ControlCrosspoint> {
        &self.inner.registry
    }

    pub fn tracker(&self) -> &Arc<RemoteCrosspointTracker> {
        &self.inner.tracker
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn create(&self, id: CrosspointId, name: &str) -> Result<Arc<ControlCrosspoint>> {
        self.inner.registry.create(id, name)
    }

    pub fn register(&self, control: Arc<ControlCrosspoint>) -> Result<()> {
        self.inner.registry.register(control)
    }

    pub fn get(&self, id: CrosspointId) -> Result<Arc<ControlCrosspoint>> {
        self.inner.registry.get(id)
    }

    pub fn try_get(&self, id: CrosspointId) -> Option<Arc<ControlCrosspoint>> {
        self.inner.registry.try_get(id)
    }

    pub fn contains(&self, id: CrosspointId) -> bool {
        self.inner.registry.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Route `control_id` to `equipment_id`; 0 disconnects
    pub async fn connect(
        &self,
        control_id: CrosspointId,
        equipment_id: CrosspointId,
    ) -> ConnectionStatus {
        self.inner.request_connect(control_id, equipment_id).await
    }

    pub async fn disconnect(&self, control_id: CrosspointId) -> ConnectionStatus {
        self.inner.request_disconnect(control_id).await
    }

    /// Equipment a control is routed to
    pub fn try_get_equipment_for_control(&self, control_id: CrosspointId) -> Option<CrosspointId> {
        self.inner.route(control_id).map(|r| r.equipment_id)
    }

    /// Disconnect and remove a control. Unknown ids are ignored.
    pub async fn unregister(&self, id: CrosspointId) -> Option<Arc<ControlCrosspoint>> {
        if self.inner.route(id).is_some() {
            self.inner.request_disconnect(id).await;
        }
        self.inner.registry.unregister(id)
    }

    /// Disconnect every control and close all pooled connections
    pub async fn shutdown(&self) {
        let routed: Vec<CrosspointId> = self.inner.routes.lock().keys().copied().collect();
        for control in routed {
            self.inner.request_disconnect(control).await;
        }
        self.inner.pool.shutdown().await;
        self.dispatcher.abort();
        info!("Control registry shut down");
    }
}

impl Drop for ControlRegistry {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
