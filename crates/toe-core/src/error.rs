//! Common error types for the toe agent.
//!
//! This module provides the error type for payload decoding and topic parsing,
//! shared across the cluster and agent crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while handling bus traffic.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A JSON payload could not be decoded.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// A topic does not belong to this device.
    #[error("topic {topic} is not under device {device}")]
    ForeignTopic {
        /// The offending topic.
        topic: String,
        /// The device whose prefix was expected.
        device: String,
    },
}
