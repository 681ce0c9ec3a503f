//! JSON payloads exchanged over the cloud and local buses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The only command with defined behavior: restart the agent.
pub const UPDATE_COMMAND: &str = "update";

/// A command addressed to the agent itself on the bare commands topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Command name.
    pub command: String,
}

impl CommandMessage {
    /// Decode a command payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object with a string
    /// `command` field.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Whether this is the restart command.
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.command == UPDATE_COMMAND
    }
}

/// A geographic position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

/// A location update received on the local bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationMessage {
    /// Reported position.
    pub location: Location,
    /// Accuracy radius in meters.
    pub accuracy: f64,
}

impl LocationMessage {
    /// Decode a location payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid location message.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Runtime status of one workload as reported in device state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatus {
    /// Image reference the workload runs.
    pub version: String,
    /// Current container condition.
    pub status: String,
    /// Container restart count.
    pub restarts: i32,
}

/// The device state snapshot published on the state channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Last known position.
    pub location: Location,
    /// Accuracy radius of `location` in meters.
    pub accuracy: f64,
    /// Per-workload status keyed by workload name.
    pub apps: BTreeMap<String, AppStatus>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            location: Location {
                lat: 29.7604,
                lng: -95.3698,
            },
            accuracy: 1000.0,
            apps: BTreeMap::new(),
        }
    }
}

impl DeviceState {
    /// Render the snapshot as a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
