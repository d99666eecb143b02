//! Remote crosspoint tracker
//!
//! Directory of remote crosspoints learned from announcements. Entries are
//! refreshed by every announcement and expire once they have not been seen
//! for `expiry_multiplier` broadcast intervals.

use crosspoint_core::{CrosspointId, CrosspointInfo, HostInfo};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{DiscoveryError, DiscoveryEvent, Result};

/// What to do when an id is announced from a second host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Overwrite with the newest announcement
    #[default]
    PreferLatest,
    /// Keep the first host until it expires
    PreferExisting,
}

/// Tracker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Interval at which remote systems announce themselves
    pub broadcast_interval_ms: u64,
    /// Entries older than this many intervals are purged
    pub expiry_multiplier: u32,
    pub conflict_policy: ConflictPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 5000,
            expiry_multiplier: 5,
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl TrackerConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    /// Age after which an entry is purged; `None` on overflow
    pub fn expiry_age(&self) -> Option<Duration> {
        self.broadcast_interval().checked_mul(self.expiry_multiplier)
    }

    /// Check the settings and return the expiry age
    pub fn validate(&self) -> Result<Duration> {
        if self.broadcast_interval_ms == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "broadcast_interval_ms must be greater than 0".into(),
            ));
        }
        if self.expiry_multiplier == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "expiry_multiplier must be greater than 0".into(),
            ));
        }
        self.expiry_age().ok_or_else(|| {
            DiscoveryError::InvalidConfig(format!(
                "expiry age of {} x {}ms overflows",
                self.expiry_multiplier, self.broadcast_interval_ms
            ))
        })
    }
}

/// Result of [`RemoteCrosspointTracker::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New id
    Inserted,
    /// Same id and host, timestamp renewed
    Refreshed,
    /// Same id on a different host, new host kept
    Replaced { previous: HostInfo },
    /// Same id on a different host, existing host kept
    Rejected { existing: HostInfo },
}

struct TrackedEntry {
    info: CrosspointInfo,
    added_at: Instant,
}

/// Time-expiring directory of remote crosspoints
pub struct RemoteCrosspointTracker {
    config: TrackerConfig,
    max_age: Duration,
    entries: Mutex<HashMap<CrosspointId, TrackedEntry>>,
    events: broadcast::Sender<DiscoveryEvent>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteCrosspointTracker {
    /// Create a tracker. Fails if `config` is rejected by
    /// [`TrackerConfig::validate`].
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let max_age = config.validate()?;
        Ok(Self::with_max_age(config, max_age))
    }

    fn with_max_age(config: TrackerConfig, max_age: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            max_age,
            entries: Mutex::new(HashMap::new()),
            events,
            expiry_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Subscribe to found/lost notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Insert or refresh an entry, stamped with the current time
    pub fn add(&self, info: CrosspointInfo) -> AddOutcome {
        self.add_at(info, Instant::now())
    }

    /// Insert or refresh an entry with an explicit timestamp
    pub fn add_at(&self, info: CrosspointInfo, now: Instant) -> AddOutcome {
        let outcome = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&info.id) {
                None => {
                    entries.insert(
                        info.id,
                        TrackedEntry {
                            info: info.clone(),
                            added_at: now,
                        },
                    );
                    AddOutcome::Inserted
                }
                Some(entry) if entry.info.host_info() == info.host_info() => {
                    entry.info = info.clone();
                    entry.added_at = now;
                    AddOutcome::Refreshed
                }
                Some(entry) => {
                    let existing = entry.info.host_info();
                    warn!(
                        "Crosspoint {} announced from {} but already known at {}",
                        info.id,
                        info.host_info(),
                        existing
                    );
                    match self.config.conflict_policy {
                        ConflictPolicy::PreferLatest => {
                            entry.info = info.clone();
                            entry.added_at = now;
                            AddOutcome::Replaced { previous: existing }
                        }
                        ConflictPolicy::PreferExisting => AddOutcome::Rejected { existing },
                    }
                }
            }
        };

        match &outcome {
            AddOutcome::Inserted | AddOutcome::Replaced { .. } => {
                debug!("Tracking crosspoint {} at {}", info.id, info.host_info());
                let _ = self.events.send(DiscoveryEvent::Found(info));
            }
            AddOutcome::Refreshed | AddOutcome::Rejected { .. } => {}
        }
        outcome
    }

    pub fn remove(&self, id: CrosspointId) -> Option<CrosspointInfo> {
        let removed = self.entries.lock().remove(&id).map(|e| e.info);
        if removed.is_some() {
            let _ = self.events.send(DiscoveryEvent::Lost(id));
        }
        removed
    }

    pub fn try_get(&self, id: CrosspointId) -> Option<CrosspointInfo> {
        self.entries.lock().get(&id).map(|e| e.info.clone())
    }

    pub fn contains(&self, id: CrosspointId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn get_all(&self) -> Vec<CrosspointInfo> {
        self.entries.lock().values().map(|e| e.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove entries older than the expiry age as of `now`.
    /// Returns the ids that were purged.
    pub fn purge_expired_at(&self, now: Instant) -> Vec<CrosspointId> {
        let max_age = self.max_age;
        let expired: Vec<CrosspointId> = {
            let mut entries = self.entries.lock();
            let expired: Vec<CrosspointId> = entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.added_at) > max_age)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                entries.remove(id);
            }
            expired
        };

        for id in &expired {
            info!("Remote crosspoint {} expired", id);
            let _ = self.events.send(DiscoveryEvent::Lost(*id));
        }
        expired
    }

    pub fn purge_expired(&self) -> Vec<CrosspointId> {
        self.purge_expired_at(Instant::now())
    }

    /// Start the periodic expiry tick. Replaces a previously started tick.
    pub fn start_expiry(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.broadcast_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(tracker) => {
                        tracker.purge_expired();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.expiry_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_expiry(&self) {
        if let Some(handle) = self.expiry_task.lock().take() {
            handle.abort();
        }
    }
}

impl Default for RemoteCrosspointTracker {
    fn default() -> Self {
        // 5000ms x 5
        Self::with_max_age(TrackerConfig::default(), Duration::from_secs(25))
    }
}

impl Drop for RemoteCrosspointTracker {
    fn drop(&mut self) {
        self.stop_expiry();
    }
}
