//! Core types and utilities for the toe device agent.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Identity**: the immutable device identity tuple and the MQTT client id
//!   derived from it
//! - **Topics**: fixed topic templates for the cloud and local buses
//! - **Messages**: JSON payloads exchanged over both buses
//! - **Error types**: decode and topic errors
//!
//! # Example
//!
//! ```
//! use toe_core::{Channel, DeviceIdentity};
//!
//! let identity = DeviceIdentity::new("my-project", "us-central1", "my-registry", "pi-01");
//!
//! assert_eq!(
//!     identity.client_id(),
//!     "projects/my-project/locations/us-central1/registries/my-registry/devices/pi-01"
//! );
//! assert_eq!(identity.topic(Channel::Config), "/devices/pi-01/config");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod identity;
pub mod messages;
pub mod topics;

pub use error::{CoreError, Result};
pub use identity::DeviceIdentity;
pub use messages::{
    AppStatus, CommandMessage, DeviceState, Location, LocationMessage, UPDATE_COMMAND,
};
pub use topics::{
    command_suffix, local_command_topic, Channel, LOCAL_EVENTS_TOPIC, LOCAL_LOCATION_TOPIC,
    LOCAL_PREFIX,
};
