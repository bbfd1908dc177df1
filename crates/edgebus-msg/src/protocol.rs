//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::PubSubError;

/// A single transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Intra-device local bus.
    Local,
    /// Cloud-facing broker.
    Broker,
}

impl Protocol {
    /// Wire/selector name of the protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Local => "local",
            Protocol::Broker => "broker",
        }
    }

    /// Capitalised name used in lifecycle events.
    pub fn title(&self) -> &'static str {
        match self {
            Protocol::Local => "Local",
            Protocol::Broker => "Broker",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transport(s) a publish or subscribe targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolSelector {
    /// Local bus only.
    Local,
    /// Broker only.
    Broker,
    /// Local bus first, then the broker.
    Both,
}

impl ProtocolSelector {
    /// Transports addressed by this selector, in fan-out order.
    pub fn protocols(&self) -> &'static [Protocol] {
        match self {
            ProtocolSelector::Local => &[Protocol::Local],
            ProtocolSelector::Broker => &[Protocol::Broker],
            ProtocolSelector::Both => &[Protocol::Local, Protocol::Broker],
        }
    }

    /// Selector name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolSelector::Local => "local",
            ProtocolSelector::Broker => "broker",
            ProtocolSelector::Both => "both",
        }
    }
}

impl From<Protocol> for ProtocolSelector {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::Local => ProtocolSelector::Local,
            Protocol::Broker => ProtocolSelector::Broker,
        }
    }
}

impl fmt::Display for ProtocolSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `local`, `broker` and `both`, plus the legacy `ipc`, `mqtt` and
/// `ipc_mqtt` spellings.
impl FromStr for ProtocolSelector {
    type Err = PubSubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "ipc" => Ok(ProtocolSelector::Local),
            "broker" | "mqtt" => Ok(ProtocolSelector::Broker),
            "both" | "ipc_mqtt" => Ok(ProtocolSelector::Both),
            _ => Err(PubSubError::UnsupportedProtocol(s.to_owned())),
        }
    }
}
