//! Equipment crosspoint (hardware driver side)

use crosspoint_core::{
    ConnectionStatus, CrosspointId, CrosspointKind, Envelope, MessageType, Signal, SignalValue,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tracing::debug;

use super::{
    notify_output, Crosspoint, InputSink, OutputObserver, SigCache, StatusCell, StatusObserver,
};
use crate::{Result, RouterError};

/// What an equipment registry attaches to its equipment
#[derive(Clone)]
pub struct EquipmentLink {
    pub sink: Weak<dyn InputSink<EquipmentCrosspoint>>,
}

#[derive(Default)]
struct EquipmentState {
    controls: BTreeSet<CrosspointId>,
    /// Feedback from the driver, replayed to every control that connects
    cache: SigCache,
    /// `(smart object, number)` → controls holding that digital high
    owners: HashMap<(u32, u32), BTreeSet<CrosspointId>>,
}

impl EquipmentState {
    /// Forget `control`'s digital holds. Returns lows for the digitals no
    /// other control still holds.
    fn release(&mut self, control: CrosspointId) -> Vec<Signal> {
        let mut released = Vec::new();
        self.owners.retain(|(so, n), holders| {
            if holders.remove(&control) && holders.is_empty() {
                released.push(Signal::digital(*so, *n, false));
            }
            !holders.is_empty()
        });
        released.sort_by_key(|s| (s.smart_object_id, s.number));
        released
    }
}

/// A hardware endpoint that any number of controls can connect to
pub struct EquipmentCrosspoint {
    id: CrosspointId,
    name: String,
    status: StatusCell,
    state: Mutex<EquipmentState>,
    link: RwLock<Option<EquipmentLink>>,
    output_observers: Mutex<Vec<OutputObserver>>,
}

impl EquipmentCrosspoint {
    pub fn new(id: CrosspointId, name: impl Into<String>) -> Result<Self> {
        if id == 0 {
            return Err(RouterError::InvalidId(id));
        }
        Ok(Self {
            id,
            name: name.into(),
            status: StatusCell::default(),
            state: Mutex::new(EquipmentState::default()),
            link: RwLock::new(None),
            output_observers: Mutex::new(Vec::new()),
        })
    }

    /// Controls currently connected, in id order
    pub fn connected_controls(&self) -> Vec<CrosspointId> {
        self.state.lock().controls.iter().copied().collect()
    }

    pub fn has_control(&self, control_id: CrosspointId) -> bool {
        self.state.lock().controls.contains(&control_id)
    }

    /// Push driver feedback to every connected control. Always updates the
    /// cache; only forwarded while at least one control is connected.
    pub fn send_input(&self, signals: Vec<Signal>) -> bool {
        let controls: Vec<CrosspointId> = {
            let mut state = self.state.lock();
            state.cache.apply_all(&signals);
            state.controls.iter().copied().collect()
        };
        if controls.is_empty() {
            debug!("Equipment {} has no controls, input cached only", self.id);
            return false;
        }

        let sink = self.link.read().as_ref().and_then(|l| l.sink.upgrade());
        match sink {
            Some(sink) => {
                sink.on_crosspoint_input(self, Envelope::message(self.id, controls, signals));
                true
            }
            None => false,
        }
    }

    /// Observe envelopes from controls (messages and clears)
    pub fn on_output<F>(&self, observer: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.output_observers.lock().push(Arc::new(observer));
    }

    pub fn cached_signals(&self) -> Vec<Signal> {
        self.state.lock().cache.snapshot()
    }

    /// Accept a control. Returns the `EquipmentConnect` reply carrying the
    /// current cache.
    pub fn initialize(&self, control_id: CrosspointId) -> Envelope {
        let (first, cache) = {
            let mut state = self.state.lock();
            let first = state.controls.is_empty();
            state.controls.insert(control_id);
            (first, state.cache.snapshot())
        };
        if first {
            self.set_status(ConnectionStatus::Connected);
        }
        debug!("Equipment {} accepted control {}", self.id, control_id);

        Envelope::new(MessageType::EquipmentConnect, self.id, vec![control_id]).with_signals(cache)
    }

    /// Remove a control, clearing the digitals only it was holding.
    /// Returns false if the control was not connected.
    pub fn deinitialize(&self, control_id: CrosspointId) -> bool {
        let (released, now_empty) = {
            let mut state = self.state.lock();
            if !state.controls.remove(&control_id) {
                return false;
            }
            (state.release(control_id), state.controls.is_empty())
        };

        self.emit_clear(control_id, released);
        if now_empty {
            self.set_status(ConnectionStatus::Idle);
        }
        debug!("Equipment {} released control {}", self.id, control_id);
        true
    }

    /// Release a control's digital holds without disconnecting it
    pub fn clear_control(&self, control_id: CrosspointId) {
        let released = {
            let mut state = self.state.lock();
            if !state.controls.contains(&control_id) {
                return;
            }
            state.release(control_id)
        };
        self.emit_clear(control_id, released);
    }

    /// Forget every control without emitting clears
    pub(crate) fn reset_controls(&self) -> Vec<CrosspointId> {
        let mut state = self.state.lock();
        state.owners.clear();
        std::mem::take(&mut state.controls).into_iter().collect()
    }

    fn emit_clear(&self, control_id: CrosspointId, released: Vec<Signal>) {
        if released.is_empty() {
            return;
        }
        let envelope = Envelope::new(MessageType::EquipmentClear, self.id, vec![control_id])
            .with_signals(released);
        notify_output(&self.output_observers, &envelope);
    }
}

impl Crosspoint for EquipmentCrosspoint {
    type Link = EquipmentLink;

    const KIND: CrosspointKind = CrosspointKind::Equipment;

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
            debug!("Equipment {} is now {}", self.id, status);
        }
        changed
    }

    fn on_status_changed(&self, observer: StatusObserver) {
        self.status.subscribe(observer);
    }

    fn attach(&self, link: EquipmentLink) {
        *self.link.write() = Some(link);
    }

    fn detach(&self) {
        *self.link.write() = None;
    }

    /// Signal traffic from controls. Digital highs are recorded against
    /// every sending control so a disconnect can release them.
    fn send_output(&self, envelope: Envelope) {
        {
            let mut state = self.state.lock();
            for signal in &envelope.signals {
                let key = (signal.smart_object_id, signal.number);
                match signal.value {
                    SignalValue::Digital(true) => {
                        let holders = state.owners.entry(key).or_default();
                        holders.extend(envelope.control_ids.iter().copied());
                    }
                    SignalValue::Digital(false) => {
                        let released = match state.owners.get_mut(&key) {
                            Some(holders) => {
                                for control in &envelope.control_ids {
                                    holders.remove(control);
                                }
                                holders.is_empty()
                            }
                            None => false,
                        };
                        if released {
                            state.owners.remove(&key);
                        }
                    }
                    _ => {}
                }
            }
        }
        notify_output(&self.output_observers, &envelope);
    }
}
