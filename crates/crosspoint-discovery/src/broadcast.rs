//! UDP announcements
//!
//! The equipment side periodically announces the crosspoints it hosts. The
//! control side listens and feeds a [`RemoteCrosspointTracker`].

use crosspoint_core::{CrosspointInfo, DEFAULT_DISCOVERY_PORT};
use crosspoint_transport::{UdpEndpoint, UdpReceiver};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{DiscoveryError, RemoteCrosspointTracker, Result};

/// Announcement configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// UDP port announcements are sent to and received on
    pub port: u16,
    /// Destination address of announcements
    pub address: String,
    pub interval_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            address: "255.255.255.255".to_string(),
            interval_ms: 5000,
        }
    }
}

impl BroadcastConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Reject a zero interval or an unparsable address
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "interval_ms must be greater than 0".into(),
            ));
        }
        self.target().map(|_| ())
    }

    fn target(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|e| DiscoveryError::Network(format!("Invalid address: {}", e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Datagram listing the crosspoints one system hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub system_id: u16,
    pub crosspoints: Vec<CrosspointInfo>,
}

impl Announcement {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DiscoveryError::InvalidAnnouncement(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| DiscoveryError::InvalidAnnouncement(e.to_string()))
    }
}

type CrosspointSource = Arc<dyn Fn() -> Vec<CrosspointInfo> + Send + Sync>;

/// Periodically sends an [`Announcement`]
pub struct Announcer {
    endpoint: UdpEndpoint,
    config: BroadcastConfig,
    system_id: u16,
    source: CrosspointSource,
}

impl Announcer {
    /// Bind an ephemeral socket. `source` is asked for the current
    /// crosspoint list before every announcement.
    pub async fn bind<F>(config: BroadcastConfig, system_id: u16, source: F) -> Result<Self>
    where
        F: Fn() -> Vec<CrosspointInfo> + Send + Sync + 'static,
    {
        config.validate()?;
        let endpoint = UdpEndpoint::bind("0.0.0.0:0")
            .await
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;
        endpoint
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;

        Ok(Self {
            endpoint,
            config,
            system_id,
            source: Arc::new(source),
        })
    }

    /// Send one announcement now
    pub async fn announce(&self) -> Result<()> {
        let announcement = Announcement {
            system_id: self.system_id,
            crosspoints: (self.source)(),
        };
        if announcement.crosspoints.is_empty() {
            return Ok(());
        }

        let bytes = announcement.encode()?;
        self.endpoint
            .send_to(&bytes, self.config.target()?)
            .await
            .map_err(|e| DiscoveryError::Broadcast(e.to_string()))?;
        debug!(
            "Announced {} crosspoints for system {}",
            announcement.crosspoints.len(),
            self.system_id
        );
        Ok(())
    }

    /// Announce every interval until the handle is aborted
    pub fn start(self) -> JoinHandle<()> {
        info!(
            "Announcing system {} to {}:{} every {:?}",
            self.system_id,
            self.config.address,
            self.config.port,
            self.config.interval()
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            loop {
                interval.tick().await;
                if let Err(e) = self.announce().await {
                    warn!("Announcement failed: {}", e);
                }
            }
        })
    }
}

/// Receives announcements and records them in a tracker
pub struct AnnouncementListener {
    endpoint: UdpEndpoint,
    system_id: u16,
    tracker: Arc<RemoteCrosspointTracker>,
}

impl AnnouncementListener {
    /// Listen on `0.0.0.0:<port>`; only announcements for `system_id` are kept
    pub async fn bind(
        port: u16,
        system_id: u16,
        tracker: Arc<RemoteCrosspointTracker>,
    ) -> Result<Self> {
        let endpoint = UdpEndpoint::bind(&format!("0.0.0.0:{}", port))
            .await
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;

        info!("Announcement listener on port {}", port);
        Ok(Self {
            endpoint,
            system_id,
            tracker,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .map_err(|e| DiscoveryError::Network(e.to_string()))
    }

    /// Apply one datagram to the tracker, returning how many entries it
    /// carried for this system
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> usize {
        let announcement = match Announcement::decode(data) {
            Ok(a) => a,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", from, e);
                return 0;
            }
        };
        if announcement.system_id != self.system_id {
            debug!(
                "Ignoring announcement for system {} from {}",
                announcement.system_id, from
            );
            return 0;
        }

        let count = announcement.crosspoints.len();
        for mut info in announcement.crosspoints {
            // Announcers that do not know their own address leave it unspecified
            if info.host.is_empty() || info.host == "0.0.0.0" {
                info.host = from.ip().to_string();
            }
            self.tracker.add(info);
        }
        count
    }

    /// Receive until the handle is aborted
    pub fn start(self) -> JoinHandle<()> {
        let mut receiver: UdpReceiver = self.endpoint.start_receiver();
        tokio::spawn(async move {
            while let Some((data, from)) = receiver.recv_from().await {
                self.handle_datagram(&data, from);
            }
        })
    }
}
