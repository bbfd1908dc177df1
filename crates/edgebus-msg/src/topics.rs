//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use edgebus_common::config::DeviceConfig;

use crate::{PubSubError, Result};

/// Topic schema derived from a base topic and a device identifier.
///
/// * ingress: `<base_topic>/<device_id>/ingress`, subscribed on both transports.
/// * egress: `<base_topic>/<device_id>/egress`, the default publish target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSchema {
    base_topic: String,
    device_id: String,
}

impl TopicSchema {
    /// Construct a schema. Surrounding slashes on the base topic are trimmed.
    pub fn new(base_topic: impl Into<String>, device_id: impl Into<String>) -> Self {
        let base_topic = base_topic.into();
        Self {
            base_topic: base_topic.trim_matches('/').to_owned(),
            device_id: device_id.into(),
        }
    }

    /// Build the schema from device configuration, resolving the device id.
    pub fn from_config(device: &DeviceConfig) -> Result<Self> {
        device
            .validate()
            .map_err(|err| PubSubError::Config(err.to_string()))?;
        let device_id = device
            .resolve_device_id()
            .map_err(|err| PubSubError::Config(err.to_string()))?;
        Ok(Self::new(device.base_topic.trim(), device_id))
    }

    /// Base topic.
    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    /// Device identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Topic this component listens on for requests.
    pub fn ingress(&self) -> String {
        format!("{}/{}/ingress", self.base_topic, self.device_id)
    }

    /// Default topic for everything this component publishes.
    pub fn egress(&self) -> String {
        format!("{}/{}/egress", self.base_topic, self.device_id)
    }
}
