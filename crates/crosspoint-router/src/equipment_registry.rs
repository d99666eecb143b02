//! Equipment side registry
//!
//! Hosts equipment crosspoints behind one or more shared listeners. Remote
//! control registries connect in, and every control they announce is bound
//! to the client connection it arrived on. Traffic from an equipment goes
//! out once per client, addressed to that client's controls only.

use crosspoint_core::{CrosspointId, CrosspointInfo, Envelope, HostInfo, MessageType};
use crosspoint_transport::{TransportError, TransportServer};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::crosspoint::{Crosspoint, EquipmentCrosspoint, EquipmentLink, InputSink};
use crate::listener::{ClientId, ConnectionHandler, ListenerLease, ListenerPool, SharedListener};
use crate::registry::CrosspointRegistry;
use crate::Result;

#[cfg(feature = "tcp")]
use crate::config::SystemConfig;

/// Where a remote control is reachable
#[derive(Clone)]
struct Binding {
    client: ClientId,
    listener: Weak<SharedListener>,
}

/// `(control id, equipment id)`
type BindingKey = (CrosspointId, CrosspointId);

struct EquipmentInner {
    registry: CrosspointRegistry<EquipmentCrosspoint>,
    bindings: Mutex<HashMap<BindingKey, Binding>>,
    leases: Mutex<Vec<ListenerLease>>,
}

impl EquipmentInner {
    fn bound_on(&self, control: CrosspointId, equipment: CrosspointId, client: ClientId) -> bool {
        self.bindings
            .lock()
            .get(&(control, equipment))
            .map(|b| b.client == client)
            .unwrap_or(false)
    }

    fn control_connect(
        &self,
        equipment: &EquipmentCrosspoint,
        listener: &Arc<SharedListener>,
        client: ClientId,
        control_ids: &[CrosspointId],
    ) {
        for &control in control_ids {
            self.bindings.lock().insert(
                (control, equipment.id()),
                Binding {
                    client,
                    listener: Arc::downgrade(listener),
                },
            );
            let reply = equipment.initialize(control);
            if let Err(e) = listener.send_envelope(client, &reply) {
                warn!(
                    "Connect reply to control {} on client {} failed: {}",
                    control, client, e
                );
            }
        }
    }

    fn control_disconnect(
        &self,
        equipment: &EquipmentCrosspoint,
        client: ClientId,
        control_ids: &[CrosspointId],
    ) {
        for &control in control_ids {
            let removed = {
                let mut bindings = self.bindings.lock();
                match bindings.get(&(control, equipment.id())) {
                    Some(b) if b.client == client => {
                        bindings.remove(&(control, equipment.id()));
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                equipment.deinitialize(control);
            }
        }
    }

    /// Route driver feedback, grouping recipients by client
    fn fan_out(&self, envelope: &Envelope) {
        let mut targets: BTreeMap<ClientId, (Weak<SharedListener>, Vec<CrosspointId>)> =
            BTreeMap::new();
        {
            let bindings = self.bindings.lock();
            for &control in &envelope.control_ids {
                if let Some(binding) = bindings.get(&(control, envelope.equipment_id)) {
                    targets
                        .entry(binding.client)
                        .or_insert_with(|| (binding.listener.clone(), Vec::new()))
                        .1
                        .push(control);
                }
            }
        }

        for (client, (listener, controls)) in targets {
            let Some(listener) = listener.upgrade() else {
                continue;
            };
            if let Err(e) = listener.send_envelope(client, &envelope.for_controls(controls)) {
                debug!("Send to client {} failed: {}", client, e);
            }
        }
    }
}

impl InputSink<EquipmentCrosspoint> for EquipmentInner {
    fn on_crosspoint_input(&self, _equipment: &EquipmentCrosspoint, envelope: Envelope) {
        self.fan_out(&envelope);
    }
}

impl ConnectionHandler for EquipmentInner {
    fn on_client_envelope(
        &self,
        listener: &Arc<SharedListener>,
        client: ClientId,
        envelope: &Envelope,
    ) -> bool {
        let Some(equipment) = self.registry.try_get(envelope.equipment_id) else {
            return false;
        };

        match envelope.message_type {
            MessageType::ControlConnect => {
                self.control_connect(&equipment, listener, client, &envelope.control_ids);
            }
            MessageType::ControlDisconnect => {
                self.control_disconnect(&equipment, client, &envelope.control_ids);
            }
            MessageType::ControlClear => {
                for &control in &envelope.control_ids {
                    if self.bound_on(control, equipment.id(), client) {
                        equipment.clear_control(control);
                    }
                }
            }
            MessageType::Message => {
                let controls: Vec<CrosspointId> = envelope
                    .control_ids
                    .iter()
                    .copied()
                    .filter(|&c| self.bound_on(c, equipment.id(), client))
                    .collect();
                if controls.is_empty() {
                    debug!(
                        "Dropping message for equipment {} from unbound controls {:?}",
                        equipment.id(),
                        envelope.control_ids
                    );
                } else {
                    equipment.send_output(envelope.for_controls(controls));
                }
            }
            other => {
                debug!("Ignoring {:?} sent to equipment {}", other, equipment.id());
            }
        }
        true
    }

    fn on_client_disconnected(&self, client: ClientId) {
        let lost: Vec<BindingKey> = {
            let mut bindings = self.bindings.lock();
            let keys: Vec<BindingKey> = bindings
                .iter()
                .filter(|(_, b)| b.client == client)
                .map(|(k, _)| *k)
                .collect();
            for key in &keys {
                bindings.remove(key);
            }
            keys
        };

        for (control, equipment) in lost {
            if let Some(equipment) = self.registry.try_get(equipment) {
                debug!(
                    "Client {} gone, releasing control {} from equipment {}",
                    client,
                    control,
                    equipment.id()
                );
                equipment.deinitialize(control);
            }
        }
    }
}

/// Registry of locally hosted equipment
pub struct EquipmentRegistry {
    inner: Arc<EquipmentInner>,
}

impl EquipmentRegistry {
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<EquipmentInner>| {
            let sink: Weak<dyn InputSink<EquipmentCrosspoint>> = weak.clone();
            EquipmentInner {
                registry: CrosspointRegistry::new(EquipmentLink { sink }),
                bindings: Mutex::new(HashMap::new()),
                leases: Mutex::new(Vec::new()),
            }
        });
        Self { inner }
    }

    /// Serve remote controls on `port`, sharing the listener with any other
    /// registry already using it
    pub async fn listen_on<S, F, Fut>(
        &self,
        pool: &Arc<ListenerPool>,
        port: u16,
        bind: F,
    ) -> Result<()>
    where
        S: TransportServer + 'static,
        S::Sender: 'static,
        S::Receiver: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<S, TransportError>>,
    {
        let inner = Arc::downgrade(&self.inner);
        let handler: Weak<dyn ConnectionHandler> = inner;
        let lease = pool.acquire(port, handler, bind).await?;
        self.inner.leases.lock().push(lease);
        Ok(())
    }

    /// Listen on the TCP port of `system`
    #[cfg(feature = "tcp")]
    pub async fn listen_tcp(&self, pool: &Arc<ListenerPool>, system: &SystemConfig) -> Result<()> {
        let host = system.host_info()?;
        let addr = host.to_string();
        info!("Equipment registry listening on {}", addr);
        self.listen_on(pool, host.port, || async move {
            crosspoint_transport::TcpServer::bind(&addr).await
        })
        .await
    }

    /// Release every listener this registry joined
    pub fn stop_listening(&self) {
        let leases = std::mem::take(&mut *self.inner.leases.lock());
        drop(leases);
    }

    pub fn registry(&self) -> &CrosspointRegistry<EquipmentCrosspoint> {
        &self.inner.registry
    }

    pub fn create(&self, id: CrosspointId, name: &str) -> Result<Arc<EquipmentCrosspoint>> {
        self.inner.registry.create(id, name)
    }

    pub fn register(&self, equipment: Arc<EquipmentCrosspoint>) -> Result<()> {
        self.inner.registry.register(equipment)
    }

    pub fn get(&self, id: CrosspointId) -> Result<Arc<EquipmentCrosspoint>> {
        self.inner.registry.get(id)
    }

    pub fn try_get(&self, id: CrosspointId) -> Option<Arc<EquipmentCrosspoint>> {
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

    /// Remove an equipment. Its remote controls are told with
    /// `EquipmentDisconnect`. Unknown ids are ignored.
    pub fn unregister(&self, id: CrosspointId) -> Option<Arc<EquipmentCrosspoint>> {
        let equipment = self.inner.registry.unregister(id)?;
        let controls = equipment.reset_controls();

        let bound: Vec<(CrosspointId, Binding)> = {
            let mut bindings = self.inner.bindings.lock();
            controls
                .iter()
                .filter_map(|&c| bindings.remove(&(c, id)).map(|b| (c, b)))
                .collect()
        };

        let mut by_client: BTreeMap<ClientId, (Weak<SharedListener>, Vec<CrosspointId>)> =
            BTreeMap::new();
        for (control, binding) in bound {
            by_client
                .entry(binding.client)
                .or_insert_with(|| (binding.listener.clone(), Vec::new()))
                .1
                .push(control);
        }
        for (client, (listener, controls)) in by_client {
            if let Some(listener) = listener.upgrade() {
                let _ = listener.send_envelope(client, &Envelope::equipment_disconnect(id, controls));
            }
        }
        Some(equipment)
    }

    pub fn clear(&self) {
        for id in self.inner.registry.ids() {
            self.unregister(id);
        }
    }

    /// Announcement entries for every hosted equipment, reachable at `host`
    pub fn crosspoint_infos(&self, host: &HostInfo) -> Vec<CrosspointInfo> {
        let mut infos: Vec<CrosspointInfo> = self
            .inner
            .registry
            .all()
            .iter()
            .map(|e| CrosspointInfo::new(e.id(), e.name(), host.clone()))
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}

impl Default for EquipmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
