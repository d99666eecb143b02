//! Router configuration

use crosspoint_core::{HostInfo, DEFAULT_BASE_PORT};
use serde::Deserialize;
use std::time::Duration;

use crate::Result;

/// Identity of the local routing domain
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Logical system id; selects the listen port
    pub system_id: u16,
    /// Address equipment listeners bind to
    pub bind_address: String,
    pub base_port: u16,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            system_id: 1,
            bind_address: "0.0.0.0".to_string(),
            base_port: DEFAULT_BASE_PORT,
        }
    }
}

impl SystemConfig {
    /// Listen endpoint, `base_port + system_id`
    pub fn host_info(&self) -> Result<HostInfo> {
        Ok(HostInfo::for_system(
            self.bind_address.clone(),
            self.system_id,
            self.base_port,
        )?)
    }
}

/// Control side registry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlRegistryConfig {
    /// Reconnect a dropped pooled connection once before failing its controls
    pub auto_reconnect: bool,
    /// How long an unused pooled connection stays open
    pub keep_alive_ms: u64,
    /// Upper bound on establishing a transport connection
    pub handshake_timeout_ms: u64,
}

impl Default for ControlRegistryConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            keep_alive_ms: 60_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl ControlRegistryConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
