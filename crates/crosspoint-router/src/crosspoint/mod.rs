//! Crosspoints
//!
//! A crosspoint is one routing endpoint owned by a registry. Both kinds
//! share identity and status handling; the registry attaches a kind-specific
//! link on registration through which the crosspoint reaches the network.

mod control;
mod equipment;
mod sig_cache;

pub use control::{ControlCrosspoint, ControlLink};
pub use equipment::{EquipmentCrosspoint, EquipmentLink};
pub use sig_cache::SigCache;

use async_trait::async_trait;
use crosspoint_core::{ConnectionStatus, CrosspointId, CrosspointKind, Envelope};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::Result;

/// Called with `(crosspoint id, new status)` after every status change
pub type StatusObserver = Arc<dyn Fn(CrosspointId, ConnectionStatus) + Send + Sync>;

/// Called with every envelope a crosspoint delivers to its local side
pub type OutputObserver = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Common interface of control and equipment crosspoints
pub trait Crosspoint: Send + Sync + Sized + 'static {
    /// Handle the owning registry attaches on registration
    type Link: Clone + Send + Sync + 'static;

    const KIND: CrosspointKind;

    /// Build an unregistered crosspoint. Id zero is rejected.
    fn construct(id: CrosspointId, name: &str) -> Result<Self>;

    fn id(&self) -> CrosspointId;

    fn name(&self) -> &str;

    fn status(&self) -> ConnectionStatus;

    /// Change status, notifying observers. Returns false for a same-state
    /// transition, which notifies nobody.
    fn set_status(&self, status: ConnectionStatus) -> bool;

    fn on_status_changed(&self, observer: StatusObserver);

    fn attach(&self, link: Self::Link);

    fn detach(&self);

    /// Deliver an envelope that arrived from the network
    fn send_output(&self, envelope: Envelope);

    fn kind(&self) -> CrosspointKind {
        Self::KIND
    }
}

/// Registry hook receiving envelopes a crosspoint wants to send
pub trait InputSink<T>: Send + Sync {
    fn on_crosspoint_input(&self, crosspoint: &T, envelope: Envelope);
}

/// Lets a control crosspoint ask its registry for a route
#[async_trait]
pub trait ConnectionRequester: Send + Sync {
    async fn request_connect(
        &self,
        control_id: CrosspointId,
        equipment_id: CrosspointId,
    ) -> ConnectionStatus;

    async fn request_disconnect(&self, control_id: CrosspointId) -> ConnectionStatus;
}

/// Status value plus its observers
#[derive(Default)]
pub(crate) struct StatusCell {
    status: Mutex<ConnectionStatus>,
    observers: Mutex<Vec<StatusObserver>>,
}

impl StatusCell {
    pub(crate) fn get(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub(crate) fn set(&self, id: CrosspointId, status: ConnectionStatus) -> bool {
        {
            let mut current = self.status.lock();
            if *current == status {
                return false;
            }
            *current = status;
        }

        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(id, status);
        }
        true
    }

    pub(crate) fn subscribe(&self, observer: StatusObserver) {
        self.observers.lock().push(observer);
    }
}

/// Fan an envelope out to output observers, outside any crosspoint lock
pub(crate) fn notify_output(observers: &Mutex<Vec<OutputObserver>>, envelope: &Envelope) {
    let observers = observers.lock().clone();
    for observer in observers {
        observer(envelope);
    }
}
