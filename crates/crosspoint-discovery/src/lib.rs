//! Crosspoint Discovery
//!
//! Lets control side registries find where an equipment crosspoint lives:
//! - [`RemoteCrosspointTracker`], a time-expiring `id → host` directory
//! - UDP announcements that feed it (`broadcast` feature)

pub mod error;
pub mod tracker;

#[cfg(feature = "broadcast")]
pub mod broadcast;

pub use error::{DiscoveryError, Result};
pub use tracker::{AddOutcome, ConflictPolicy, RemoteCrosspointTracker, TrackerConfig};

#[cfg(feature = "broadcast")]
pub use broadcast::{Announcement, AnnouncementListener, Announcer, BroadcastConfig};

use crosspoint_core::{CrosspointId, CrosspointInfo};

/// Tracker change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Crosspoint became known, or moved to another host
    Found(CrosspointInfo),
    /// Crosspoint removed or expired
    Lost(CrosspointId),
}
