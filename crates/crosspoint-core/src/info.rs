//! Network identity of crosspoints and hosts

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CrosspointId, Error, Result};

/// Address and port of a network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostInfo {
    pub address: String,
    pub port: u16,
}

impl HostInfo {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Derive the listen endpoint of a logical system.
    ///
    /// Every system id maps to its own TCP port (`base_port + system_id`) so
    /// independent routing domains can share a host.
    pub fn for_system(address: impl Into<String>, system_id: u16, base_port: u16) -> Result<Self> {
        let port = base_port.checked_add(system_id).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "system id {} overflows base port {}",
                system_id, base_port
            ))
        })?;
        Ok(Self::new(address, port))
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A crosspoint as seen from the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosspointInfo {
    pub id: CrosspointId,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl CrosspointInfo {
    pub fn new(id: CrosspointId, name: impl Into<String>, host: HostInfo) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.address,
            port: host.port,
        }
    }

    pub fn host_info(&self) -> HostInfo {
        HostInfo::new(self.host.clone(), self.port)
    }
}
