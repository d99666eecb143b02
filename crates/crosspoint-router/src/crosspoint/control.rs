//! Control crosspoint (user interface side)

use crosspoint_core::{
    ConnectionStatus, CrosspointId, CrosspointKind, Envelope, MessageType, Signal,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::{
    notify_output, ConnectionRequester, Crosspoint, InputSink, OutputObserver, SigCache,
    StatusCell, StatusObserver,
};
use crate::{Result, RouterError};

/// What a control registry attaches to its controls
#[derive(Clone)]
pub struct ControlLink {
    pub sink: Weak<dyn InputSink<ControlCrosspoint>>,
    pub requester: Weak<dyn ConnectionRequester>,
}

#[derive(Default)]
struct ControlState {
    connected_equipment_id: CrosspointId,
    /// Signals received from the equipment that are still set
    cache: SigCache,
    /// Releases owed to the local side, merged into the next payload
    sigs_waiting_to_be_cleared: Vec<Signal>,
}

/// A user interface endpoint that connects to one equipment at a time
pub struct ControlCrosspoint {
    id: CrosspointId,
    name: String,
    status: StatusCell,
    state: Mutex<ControlState>,
    link: RwLock<Option<ControlLink>>,
    output_observers: Mutex<Vec<OutputObserver>>,
}

impl ControlCrosspoint {
    pub fn new(id: CrosspointId, name: impl Into<String>) -> Result<Self> {
        if id == 0 {
            return Err(RouterError::InvalidId(id));
        }
        Ok(Self {
            id,
            name: name.into(),
            status: StatusCell::default(),
            state: Mutex::new(ControlState::default()),
            link: RwLock::new(None),
            output_observers: Mutex::new(Vec::new()),
        })
    }

    /// Equipment this control is routed to, 0 when none
    pub fn connected_equipment_id(&self) -> CrosspointId {
        self.state.lock().connected_equipment_id
    }

    /// Ask the owning registry to route this control to `equipment_id`.
    /// An id of 0 disconnects.
    pub async fn connect(&self, equipment_id: CrosspointId) -> ConnectionStatus {
        match self.requester() {
            Some(requester) => requester.request_connect(self.id, equipment_id).await,
            None => {
                warn!("Control {} is not registered", self.id);
                ConnectionStatus::ControlNotFound
            }
        }
    }

    pub async fn disconnect(&self) -> ConnectionStatus {
        match self.requester() {
            Some(requester) => requester.request_disconnect(self.id).await,
            None => {
                warn!("Control {} is not registered", self.id);
                ConnectionStatus::ControlNotFound
            }
        }
    }

    /// Send signals to the connected equipment. Dropped when not connected.
    pub fn send_input(&self, signals: Vec<Signal>) -> bool {
        let equipment_id = self.connected_equipment_id();
        if equipment_id == 0 {
            debug!("Control {} not connected, dropping input", self.id);
            return false;
        }

        let sink = self.link.read().as_ref().and_then(|l| l.sink.upgrade());
        match sink {
            Some(sink) => {
                let envelope = Envelope::message(equipment_id, vec![self.id], signals);
                sink.on_crosspoint_input(self, envelope);
                true
            }
            None => false,
        }
    }

    /// Observe envelopes delivered to the local side
    pub fn on_output<F>(&self, observer: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.output_observers.lock().push(Arc::new(observer));
    }

    /// Signals currently set, as received from the equipment
    pub fn cached_signals(&self) -> Vec<Signal> {
        self.state.lock().cache.snapshot()
    }

    fn requester(&self) -> Option<Arc<dyn ConnectionRequester>> {
        self.link.read().as_ref().and_then(|l| l.requester.upgrade())
    }

    /// Record a new route. Switching directly from another equipment keeps
    /// the old signals as a deferred clear.
    pub(crate) fn bind_equipment(&self, equipment_id: CrosspointId) {
        let mut state = self.state.lock();
        if state.connected_equipment_id != 0 && state.connected_equipment_id != equipment_id {
            let cleared = state.cache.drain_cleared();
            state.sigs_waiting_to_be_cleared.extend(cleared);
        }
        state.connected_equipment_id = equipment_id;
    }

    /// Move the cache into the deferred clear so the next payload from the
    /// equipment replaces it
    pub(crate) fn defer_clear(&self) {
        let mut state = self.state.lock();
        let cleared = state.cache.drain_cleared();
        state.sigs_waiting_to_be_cleared.extend(cleared);
    }

    /// Drop the route and release everything the local side still shows
    pub(crate) fn unbind_equipment(&self) {
        let envelope = {
            let mut state = self.state.lock();
            let equipment_id = std::mem::take(&mut state.connected_equipment_id);
            let mut cleared = std::mem::take(&mut state.sigs_waiting_to_be_cleared);
            for signal in state.cache.drain_cleared() {
                if !cleared.iter().any(|s| s.key() == signal.key()) {
                    cleared.push(signal);
                }
            }
            if cleared.is_empty() {
                return;
            }
            Envelope::new(MessageType::ControlClear, equipment_id, vec![self.id])
                .with_signals(cleared)
        };
        notify_output(&self.output_observers, &envelope);
    }
}

impl Crosspoint for ControlCrosspoint {
    type Link = ControlLink;

    const KIND: CrosspointKind = CrosspointKind::Control;

    fn construct(id: CrosspointId, name: &str) -> Result<Self> {
        Self::new(id, name)
    }

    fn id(&self) -> CrosspointId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    fn set_status(&self, status: ConnectionStatus) -> bool {
        let changed = self.status.set(self.id, status);
        if changed {
            debug!("Control {} is now {}", self.id, status);
        }
        changed
    }

    fn on_status_changed(&self, observer: StatusObserver) {
        self.status.subscribe(observer);
    }

    fn attach(&self, link: ControlLink) {
        *self.link.write() = Some(link);
    }

    fn detach(&self) {
        *self.link.write() = None;
    }

    fn send_output(&self, envelope: Envelope) {
        let delivered = {
            let mut state = self.state.lock();
            state.cache.apply_all(&envelope.signals);

            let carries_payload = matches!(
                envelope.message_type,
                MessageType::EquipmentConnect | MessageType::Message | MessageType::EquipmentClear
            );
            if carries_payload && !state.sigs_waiting_to_be_cleared.is_empty() {
                let pending = std::mem::take(&mut state.sigs_waiting_to_be_cleared);
                let mut signals: Vec<Signal> = pending
                    .into_iter()
                    .filter(|p| !envelope.signals.iter().any(|s| s.key() == p.key()))
                    .collect();
                signals.extend(envelope.signals);
                Envelope { signals, ..envelope }
            } else {
                envelope
            }
        };
        notify_output(&self.output_observers, &delivered);
    }
}
