//! Common test helpers for crosspoint tests
//!
//! - Condition-based waiting (no hardcoded sleeps)
//! - Envelope and status collectors for crosspoint observers
//! - An in-memory routing system with RAII cleanup

use crosspoint_core::{ConnectionStatus, CrosspointId, CrosspointInfo, Envelope, HostInfo};
use crosspoint_discovery::RemoteCrosspointTracker;
use crosspoint_router::{
    ControlCrosspoint, ControlRegistry, ControlRegistryConfig, Crosspoint, EquipmentCrosspoint,
    EquipmentRegistry, ListenerPool, StatusObserver,
};
use crosspoint_transport::MemoryNetwork;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Find an available UDP port for testing
pub fn find_available_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait for a boolean flag to become true
pub async fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_for(
        || async { flag.load(Ordering::SeqCst) },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

/// Wait with notification - more efficient than polling
pub async fn wait_with_notify(notify: &Notify, max_wait: Duration) -> bool {
    timeout(max_wait, notify.notified()).await.is_ok()
}

/// Wait for a crosspoint to reach `status`
pub async fn wait_for_status<T: Crosspoint>(
    crosspoint: &T,
    status: ConnectionStatus,
    max_wait: Duration,
) -> bool {
    wait_for(
        || async { crosspoint.status() == status },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Collectors
// ============================================================================

/// Records every envelope a crosspoint delivers to its local side
#[derive(Clone, Default)]
pub struct EnvelopeCollector {
    envelopes: Arc<parking_lot::Mutex<Vec<Envelope>>>,
    count: Arc<AtomicU32>,
}

impl EnvelopeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer to hand to `on_output`
    pub fn callback(&self) -> impl Fn(&Envelope) + Send + Sync + 'static {
        let envelopes = self.envelopes.clone();
        let count = self.count.clone();
        move |envelope| {
            envelopes.lock().push(envelope.clone());
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait for at least n envelopes to be received
    pub async fn wait_for_count(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.count, n, max_wait).await
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().clone()
    }

    pub fn last(&self) -> Option<Envelope> {
        self.envelopes.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.envelopes.lock().clear();
        self.count.store(0, Ordering::SeqCst);
    }
}

/// Records every status transition of the crosspoints it observes
#[derive(Clone, Default)]
pub struct StatusCollector {
    transitions: Arc<parking_lot::Mutex<Vec<(CrosspointId, ConnectionStatus)>>>,
}

impl StatusCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer to hand to `on_status_changed`
    pub fn observer(&self) -> StatusObserver {
        let transitions = self.transitions.clone();
        Arc::new(move |id, status| transitions.lock().push((id, status)))
    }

    pub fn statuses_of(&self, id: CrosspointId) -> Vec<ConnectionStatus> {
        self.transitions
            .lock()
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, s)| *s)
            .collect()
    }
}

// ============================================================================
// Test System - in-memory control and equipment registries
// ============================================================================

/// A control registry and an equipment registry joined by an in-memory
/// network. Equipment created through it is announced to the tracker.
pub struct TestSystem {
    pub network: Arc<MemoryNetwork>,
    pub tracker: Arc<RemoteCrosspointTracker>,
    pub listeners: Arc<ListenerPool>,
    pub equipment: EquipmentRegistry,
    pub controls: ControlRegistry,
    pub host: HostInfo,
}

impl TestSystem {
    /// Start with default configuration
    pub async fn start() -> Self {
        Self::start_with_config(ControlRegistryConfig::default()).await
    }

    /// Start with a custom control registry configuration
    pub async fn start_with_config(config: ControlRegistryConfig) -> Self {
        let network = MemoryNetwork::new();
        let host = HostInfo::new("equipment", 41801);
        let tracker = Arc::new(RemoteCrosspointTracker::default());
        let listeners = ListenerPool::new();

        let equipment = EquipmentRegistry::new();
        let net = network.clone();
        let addr = host.to_string();
        equipment
            .listen_on(&listeners, host.port, move || async move { net.bind(addr) })
            .await
            .expect("memory listener should bind");

        let controls =
            ControlRegistry::new(config, tracker.clone(), Arc::new(network.connector()));

        Self {
            network,
            tracker,
            listeners,
            equipment,
            controls,
            host,
        }
    }

    /// Create an equipment and make it resolvable
    pub fn add_equipment(&self, id: CrosspointId, name: &str) -> Arc<EquipmentCrosspoint> {
        let equipment = self
            .equipment
            .create(id, name)
            .expect("equipment id should be free");
        self.tracker
            .add(CrosspointInfo::new(id, name, self.host.clone()));
        equipment
    }

    pub fn add_control(&self, id: CrosspointId, name: &str) -> Arc<ControlCrosspoint> {
        self.controls
            .create(id, name)
            .expect("control id should be free")
    }

    /// Live connections into the equipment listener
    pub fn live_connections(&self) -> usize {
        self.network.live_connections(&self.host.to_string())
    }

    /// Cut every connection into the equipment listener
    pub fn sever(&self) -> usize {
        self.network.sever(&self.host.to_string())
    }
}
