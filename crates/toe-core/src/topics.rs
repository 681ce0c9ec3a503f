//! Topic templates for the cloud and local buses.
//!
//! Cloud topics follow `/devices/{device}/{channel}`. Commands additionally
//! carry sub-command paths below the bare commands topic, which are mapped
//! onto the local bus under [`LOCAL_PREFIX`].

use std::fmt;

use crate::error::{CoreError, Result};

/// Prefix of every topic the agent uses on the local bus.
pub const LOCAL_PREFIX: &str = "toe";

/// Local topic whose payloads are forwarded to the cloud as telemetry.
pub const LOCAL_EVENTS_TOPIC: &str = "toe/events";

/// Local topic carrying location updates.
pub const LOCAL_LOCATION_TOPIC: &str = "toe/location";

/// A per-device cloud channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Inbound workload manifests.
    Config,
    /// Outbound device state snapshots.
    State,
    /// Outbound telemetry events.
    Events,
    /// Inbound commands.
    Commands,
}

impl Channel {
    /// The topic segment naming this channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::State => "state",
            Self::Events => "events",
            Self::Commands => "commands",
        }
    }

    /// The topic for this channel on the given device.
    #[must_use]
    pub fn topic_for(self, device: &str) -> String {
        format!("/devices/{device}/{}", self.as_str())
    }

    /// The wildcard filter capturing this channel and everything below it.
    #[must_use]
    pub fn subtree_filter(self, device: &str) -> String {
        format!("{}/#", self.topic_for(device))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a cloud sub-command topic onto the local bus.
///
/// The leading `/devices/{device}/commands` segments are stripped and the
/// remainder is placed under [`LOCAL_PREFIX`], so
/// `/devices/d/commands/foo/bar` becomes `toe/foo/bar`.
///
/// # Errors
///
/// Returns [`CoreError::ForeignTopic`] if the topic is not a sub-path of the
/// device's commands topic.
pub fn local_command_topic(device: &str, topic: &str) -> Result<String> {
    let suffix = command_suffix(device, topic)?;
    Ok(format!("{LOCAL_PREFIX}/{suffix}"))
}

/// The part of a sub-command topic below `/devices/{device}/commands/`.
///
/// # Errors
///
/// Returns [`CoreError::ForeignTopic`] if the topic is not a non-empty
/// sub-path of the device's commands topic.
pub fn command_suffix<'a>(device: &str, topic: &'a str) -> Result<&'a str> {
    let base = Channel::Commands.topic_for(device);
    topic
        .strip_prefix(base.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| CoreError::ForeignTopic {
            topic: topic.to_string(),
            device: device.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_topics() {
        assert_eq!(Channel::Config.topic_for("d"), "/devices/d/config");
        assert_eq!(
            Channel::Commands.subtree_filter("d"),
            "/devices/d/commands/#"
        );
        assert_eq!(Channel::Events.to_string(), "events");
    }

    #[test]
    fn sub_command_maps_to_local_topic() {
        assert_eq!(
            local_command_topic("d", "/devices/d/commands/foo/bar").unwrap(),
            "toe/foo/bar"
        );
        assert_eq!(
            local_command_topic("d", "/devices/d/commands/x").unwrap(),
            "toe/x"
        );
    }

    #[test]
    fn bare_commands_topic_has_no_suffix() {
        assert!(command_suffix("d", "/devices/d/commands").is_err());
        assert!(command_suffix("d", "/devices/d/commands/").is_err());
    }

    #[test]
    fn foreign_topics_rejected() {
        assert!(command_suffix("d", "/devices/other/commands/foo").is_err());
        assert!(command_suffix("d", "/devices/d/commandsfoo").is_err());
        assert!(command_suffix("d", "/devices/d/config").is_err());
    }
}
