//! Crosspoint Router
//!
//! Connection management between control and equipment crosspoints:
//! - Keeps crosspoints in id-unique registries
//! - Resolves equipment ids through the discovery tracker
//! - Shares outbound connections per host with deferred disposal
//! - Shares listening ports between equipment registries
//! - Tracks which control holds which digital signal, so a disconnect
//!   clears exactly what that control left set
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crosspoint_discovery::{RemoteCrosspointTracker, TrackerConfig};
//! use crosspoint_router::{ControlRegistry, ControlRegistryConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tracker = Arc::new(RemoteCrosspointTracker::new(TrackerConfig::default())?);
//!     let controls = ControlRegistry::tcp(ControlRegistryConfig::default(), tracker);
//!
//!     let panel = controls.create(1, "Lobby Panel")?;
//!     let status = panel.connect(100).await;
//!     println!("panel is {}", status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control_registry;
pub mod crosspoint;
pub mod equipment_registry;
pub mod error;
pub mod listener;
pub mod pool;
pub mod registry;

pub use config::{ControlRegistryConfig, SystemConfig};
pub use control_registry::ControlRegistry;
pub use crosspoint::{
    ConnectionRequester, ControlCrosspoint, Crosspoint, EquipmentCrosspoint, InputSink,
    OutputObserver, SigCache, StatusObserver,
};
pub use equipment_registry::EquipmentRegistry;
pub use error::{Result, RouterError};
pub use listener::{ClientId, ConnectionHandler, ListenerLease, ListenerPool, SharedListener};
pub use pool::{ConnectionId, ConnectionPool, Generation, PoolEvent, PooledConnection};
pub use registry::{CrosspointRegistry, RegistryEvent, RegistryObserver};
