//! Error types for the cluster crate.

use thiserror::Error;

/// Errors that can occur while talking to the cluster or decoding manifests.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// The manifest payload is not a JSON array of deployments.
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    /// The manifest decoded but violates a structural rule.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Workload not found in the cluster.
    #[error("Workload not found: {0}")]
    NotFound(String),

    /// Workload already exists.
    #[error("Workload already exists: {0}")]
    AlreadyExists(String),

    /// The workload changed between read and write.
    #[error("Conflict updating workload: {0}")]
    Conflict(String),

    /// Client configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Whether this is an optimistic-concurrency conflict on write.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::KubeApi(kube::Error::Api(e)) => e.code == 409 && e.reason == "Conflict",
            _ => false,
        }
    }

    /// Whether the target object already exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            Self::KubeApi(kube::Error::Api(e)) => e.code == 409 && e.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Whether the target object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::KubeApi(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Whether the error came from decoding an inbound manifest.
    #[must_use]
    pub const fn is_manifest_error(&self) -> bool {
        matches!(self, Self::Manifest(_) | Self::InvalidManifest(_))
    }
}

/// A specialized Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
