//! Crosspoint connection status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle of a crosspoint.
///
/// `Uninitialized → Idle ⇄ Connected`. The failure states describe how the
/// last attempt or session ended; the next connect attempt starts from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not yet owned by a registry
    #[default]
    Uninitialized,
    Idle,
    Connected,
    /// The control id is unknown to the registry
    ControlNotFound,
    /// The equipment id could not be resolved
    EquipmentNotFound,
    /// The transport could not be established
    ConnectFailed,
    /// The transport went away while connected
    ConnectionDropped,
    /// The remote side ended the session
    ConnectionClosedRemote,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// True for the per-attempt failure states
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::ControlNotFound
                | ConnectionStatus::EquipmentNotFound
                | ConnectionStatus::ConnectFailed
                | ConnectionStatus::ConnectionDropped
                | ConnectionStatus::ConnectionClosedRemote
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Uninitialized => "uninitialized",
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::ControlNotFound => "control not found",
            ConnectionStatus::EquipmentNotFound => "equipment not found",
            ConnectionStatus::ConnectFailed => "connect failed",
            ConnectionStatus::ConnectionDropped => "connection dropped",
            ConnectionStatus::ConnectionClosedRemote => "connection closed by remote",
        };
        f.write_str(s)
    }
}
