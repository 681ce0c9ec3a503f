//! Error types for the agent.
//!
//! Errors from the lower crates are wrapped as-is; the agent adds transport,
//! connection, configuration and decode failures.

use thiserror::Error;

/// A result type using `AgentError`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while running the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Topic or payload error from the core crate.
    #[error("{0}")]
    Core(#[from] toe_core::CoreError),

    /// Key loading or credential minting error.
    #[error("credential error: {0}")]
    Auth(#[from] toe_auth::AuthError),

    /// Cluster access or manifest error.
    #[error("cluster error: {0}")]
    Cluster(#[from] toe_cluster::ClusterError),

    /// A publish, subscribe or disconnect was rejected by the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker could not be reached or refused the connection.
    #[error("failed to connect {client_id}: {reason}")]
    Connect {
        /// Client id used for the attempt.
        client_id: String,
        /// Why the attempt failed.
        reason: String,
    },

    /// Startup configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Returns `true` for errors that abort the process when hit at
    /// startup: unusable keys, unreachable brokers and bad configuration.
    #[must_use]
    pub const fn is_fatal_at_startup(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_key_error(),
            Self::Connect { .. } | Self::Config(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if the error came from decoding an inbound message.
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        match self {
            Self::Core(toe_core::CoreError::Decode(_)) => true,
            Self::Cluster(e) => e.is_manifest_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn startup_fatality() {
        let key = AgentError::Auth(toe_auth::AuthError::KeyLoad {
            path: PathBuf::from("/etc/toe/key.pem"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert!(key.is_fatal_at_startup());

        let connect = AgentError::Connect {
            client_id: "toe".into(),
            reason: "refused".into(),
        };
        assert!(connect.is_fatal_at_startup());
        assert!(connect.to_string().contains("refused"));

        assert!(!AgentError::Transport("timeout".into()).is_fatal_at_startup());
        assert!(!AgentError::Auth(toe_auth::AuthError::Signing("x".into())).is_fatal_at_startup());
    }

    #[test]
    fn decode_classification() {
        let bad_json = serde_json_error();
        assert!(AgentError::Core(toe_core::CoreError::Decode(bad_json)).is_decode_error());
        assert!(
            AgentError::Cluster(toe_cluster::ClusterError::InvalidManifest("dup".into()))
                .is_decode_error()
        );
        assert!(!AgentError::Transport("closed".into()).is_decode_error());
    }

    fn serde_json_error() -> serde_json::Error {
        serde_json::from_str::<u8>("nope").unwrap_err()
    }
}
