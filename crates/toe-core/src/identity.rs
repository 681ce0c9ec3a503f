//! Device identity.
//!
//! The identity is fixed at startup and never mutated. It names the MQTT
//! client, scopes every cloud topic, and supplies the audience of minted
//! credentials.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topics::Channel;

/// The `{project, region, registry, device}` tuple identifying this agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Cloud project id, also the credential audience.
    pub project: String,
    /// Cloud region of the device registry.
    pub region: String,
    /// Device registry id (short form).
    pub registry: String,
    /// Device id within the registry.
    pub device: String,
}

impl DeviceIdentity {
    /// Create a new identity.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        region: impl Into<String>,
        registry: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            region: region.into(),
            registry: registry.into(),
            device: device.into(),
        }
    }

    /// The fully qualified MQTT client id for the cloud bridge.
    #[must_use]
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project, self.region, self.registry, self.device
        )
    }

    /// The audience claim for credentials minted for this device.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.project
    }

    /// The cloud topic for one of this device's channels.
    #[must_use]
    pub fn topic(&self, channel: Channel) -> String {
        channel.topic_for(&self.device)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.client_id())
    }
}
