//! Credential error types.

use std::path::PathBuf;

use thiserror::Error;

/// A result type using `AuthError`.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur while loading keys or minting credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The private key file could not be read.
    #[error("failed to read signing key {path}: {source}")]
    KeyLoad {
        /// Path of the key file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The private key file was read but is not a usable PEM key.
    #[error("malformed signing key {path}: {reason}")]
    MalformedKey {
        /// Path of the key file.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },

    /// The signing primitive rejected the claim set.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The requested validity cannot be represented.
    #[error("invalid credential validity: {0}")]
    InvalidValidity(String),
}

impl AuthError {
    /// Returns `true` if the error stems from the key material rather than
    /// from signing itself.
    #[must_use]
    pub const fn is_key_error(&self) -> bool {
        matches!(self, Self::KeyLoad { .. } | Self::MalformedKey { .. })
    }
}
