//! Generic crosspoint registry
//!
//! Owns crosspoints of one kind keyed by id. Registration attaches the
//! registry's link to the crosspoint and moves it to `Idle`; unregistration
//! detaches it and moves it back to `Uninitialized`. Observers always run
//! after the map lock is released.

use crosspoint_core::{ConnectionStatus, CrosspointId, Envelope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::crosspoint::Crosspoint;
use crate::{Result, RouterError};

/// Registry membership change
pub enum RegistryEvent<T> {
    Registered(Arc<T>),
    Unregistered(Arc<T>),
}

pub type RegistryObserver<T> = Arc<dyn Fn(&RegistryEvent<T>) + Send + Sync>;

/// Thread-safe `id → crosspoint` map
pub struct CrosspointRegistry<T: Crosspoint> {
    crosspoints: Mutex<HashMap<CrosspointId, Arc<T>>>,
    link: T::Link,
    observers: Mutex<Vec<RegistryObserver<T>>>,
}

impl<T: Crosspoint> CrosspointRegistry<T> {
    pub fn new(link: T::Link) -> Self {
        Self {
            crosspoints: Mutex::new(HashMap::new()),
            link,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&RegistryEvent<T>) + Send + Sync + 'static,
    {
        self.observers.lock().push(Arc::new(observer));
    }

    /// Add an existing crosspoint
    pub fn register(&self, crosspoint: Arc<T>) -> Result<()> {
        let id = crosspoint.id();
        if id == 0 {
            return Err(RouterError::InvalidId(id));
        }
        {
            let mut crosspoints = self.crosspoints.lock();
            if crosspoints.contains_key(&id) {
                return Err(RouterError::DuplicateId(id));
            }
            crosspoint.attach(self.link.clone());
            crosspoints.insert(id, crosspoint.clone());
        }

        self.registered(crosspoint);
        Ok(())
    }

    /// Construct and register in one step, so no reader sees a half
    /// registered id
    pub fn create(&self, id: CrosspointId, name: &str) -> Result<Arc<T>> {
        let crosspoint = {
            let mut crosspoints = self.crosspoints.lock();
            if crosspoints.contains_key(&id) {
                return Err(RouterError::DuplicateId(id));
            }
            let crosspoint = Arc::new(T::construct(id, name)?);
            crosspoint.attach(self.link.clone());
            crosspoints.insert(id, crosspoint.clone());
            crosspoint
        };

        self.registered(crosspoint.clone());
        Ok(crosspoint)
    }

    /// Remove a crosspoint. Unknown ids are ignored.
    pub fn unregister(&self, id: CrosspointId) -> Option<Arc<T>> {
        let crosspoint = self.crosspoints.lock().remove(&id)?;
        crosspoint.detach();
        crosspoint.set_status(ConnectionStatus::Uninitialized);
        info!("Unregistered {} {}", T::KIND, id);

        self.notify(&RegistryEvent::Unregistered(crosspoint.clone()));
        Some(crosspoint)
    }

    pub fn get(&self, id: CrosspointId) -> Result<Arc<T>> {
        self.try_get(id).ok_or(RouterError::NotFound(id))
    }

    pub fn try_get(&self, id: CrosspointId) -> Option<Arc<T>> {
        self.crosspoints.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: CrosspointId) -> bool {
        self.crosspoints.lock().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<CrosspointId> {
        let mut ids: Vec<CrosspointId> = self.crosspoints.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn all(&self) -> Vec<Arc<T>> {
        self.crosspoints.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.crosspoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.crosspoints.lock().is_empty()
    }

    /// Unregister everything
    pub fn clear(&self) {
        for id in self.ids() {
            self.unregister(id);
        }
    }

    /// Deliver network data to a crosspoint
    pub fn send_to_crosspoint(&self, id: CrosspointId, envelope: Envelope) -> bool {
        match self.try_get(id) {
            Some(crosspoint) => {
                crosspoint.send_output(envelope);
                true
            }
            None => {
                debug!("No {} {} for incoming envelope", T::KIND, id);
                false
            }
        }
    }

    fn registered(&self, crosspoint: Arc<T>) {
        crosspoint.set_status(ConnectionStatus::Idle);
        info!(
            "Registered {} {} ({})",
            T::KIND,
            crosspoint.id(),
            crosspoint.name()
        );
        self.notify(&RegistryEvent::Registered(crosspoint));
    }

    fn notify(&self, event: &RegistryEvent<T>) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(event);
        }
    }
}
