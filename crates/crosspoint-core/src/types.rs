//! Envelope and signal definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Crosspoint identifier. Zero is reserved for "none".
pub type CrosspointId = u32;

/// Envelope message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    /// Control asks to attach to an equipment
    ControlConnect,
    /// Control detaches from an equipment
    ControlDisconnect,
    /// Equipment accepted a control; carries its current signal cache
    EquipmentConnect,
    /// Equipment dropped the named controls
    EquipmentDisconnect,
    /// Equipment-originated clear of signals
    EquipmentClear,
    /// Control-originated clear of signals
    ControlClear,
    /// Signal traffic
    Message,
}

/// Which side of a route a crosspoint sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrosspointKind {
    /// User interface side, initiates connections
    Control,
    /// Hardware side, accepts connections
    Equipment,
}

impl fmt::Display for CrosspointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrosspointKind::Control => f.write_str("control"),
            CrosspointKind::Equipment => f.write_str("equipment"),
        }
    }
}

/// Signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Digital,
    Analog,
    Serial,
}

/// Value carried by a signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalValue {
    Digital(bool),
    Analog(u16),
    Serial(String),
}

impl SignalValue {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalValue::Digital(_) => SignalType::Digital,
            SignalValue::Analog(_) => SignalType::Analog,
            SignalValue::Serial(_) => SignalType::Serial,
        }
    }

    /// The "released" value of the same type
    pub fn cleared(&self) -> Self {
        match self {
            SignalValue::Digital(_) => SignalValue::Digital(false),
            SignalValue::Analog(_) => SignalValue::Analog(0),
            SignalValue::Serial(_) => SignalValue::Serial(String::new()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SignalValue::Serial(s) => Some(s),
            _ => None,
        }
    }
}

/// Cache key of a signal: `(smart object, number, type)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey {
    pub smart_object_id: u32,
    pub number: u32,
    pub signal_type: SignalType,
}

/// A typed value addressed by `(smart_object_id, number)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "so")]
    pub smart_object_id: u32,
    #[serde(rename = "n")]
    pub number: u32,
    #[serde(rename = "v")]
    pub value: SignalValue,
}

impl Signal {
    pub fn new(smart_object_id: u32, number: u32, value: SignalValue) -> Self {
        Self {
            smart_object_id,
            number,
            value,
        }
    }

    pub fn digital(smart_object_id: u32, number: u32, value: bool) -> Self {
        Self::new(smart_object_id, number, SignalValue::Digital(value))
    }

    pub fn analog(smart_object_id: u32, number: u32, value: u16) -> Self {
        Self::new(smart_object_id, number, SignalValue::Analog(value))
    }

    pub fn serial(smart_object_id: u32, number: u32, value: impl Into<String>) -> Self {
        Self::new(smart_object_id, number, SignalValue::Serial(value.into()))
    }

    pub fn signal_type(&self) -> SignalType {
        self.value.signal_type()
    }

    pub fn key(&self) -> SignalKey {
        SignalKey {
            smart_object_id: self.smart_object_id,
            number: self.number,
            signal_type: self.signal_type(),
        }
    }

    /// Copy of this signal carrying its released value
    pub fn cleared(&self) -> Self {
        Self::new(self.smart_object_id, self.number, self.value.cleared())
    }
}

/// The routed message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "t")]
    pub message_type: MessageType,
    #[serde(rename = "eq", default)]
    pub equipment_id: CrosspointId,
    #[serde(rename = "ctl", default, skip_serializing_if = "Vec::is_empty")]
    pub control_ids: Vec<CrosspointId>,
    #[serde(rename = "sigs", default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<Signal>,
}

impl Envelope {
    pub fn new(
        message_type: MessageType,
        equipment_id: CrosspointId,
        control_ids: Vec<CrosspointId>,
    ) -> Self {
        Self {
            message_type,
            equipment_id,
            control_ids,
            signals: Vec::new(),
        }
    }

    pub fn with_signals(mut self, signals: Vec<Signal>) -> Self {
        self.signals = signals;
        self
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, 0, Vec::new())
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, 0, Vec::new())
    }

    pub fn control_connect(equipment_id: CrosspointId, control_id: CrosspointId) -> Self {
        Self::new(MessageType::ControlConnect, equipment_id, vec![control_id])
    }

    pub fn control_disconnect(equipment_id: CrosspointId, control_id: CrosspointId) -> Self {
        Self::new(MessageType::ControlDisconnect, equipment_id, vec![control_id])
    }

    pub fn equipment_disconnect(equipment_id: CrosspointId, control_ids: Vec<CrosspointId>) -> Self {
        Self::new(MessageType::EquipmentDisconnect, equipment_id, control_ids)
    }

    pub fn message(
        equipment_id: CrosspointId,
        control_ids: Vec<CrosspointId>,
        signals: Vec<Signal>,
    ) -> Self {
        Self::new(MessageType::Message, equipment_id, control_ids).with_signals(signals)
    }

    /// Check whether a control id is among the recipients
    pub fn is_for_control(&self, control_id: CrosspointId) -> bool {
        self.control_ids.contains(&control_id)
    }

    /// Copy of this envelope narrowed to a subset of controls
    pub fn for_controls(&self, control_ids: Vec<CrosspointId>) -> Self {
        Self {
            message_type: self.message_type,
            equipment_id: self.equipment_id,
            control_ids,
            signals: self.signals.clone(),
        }
    }
}
