//! Signed device credentials for the toe cloud session.
//!
//! The cloud bridge authenticates each MQTT connection with a short-lived
//! JWT signed by the device's private key. This crate provides:
//!
//! - PEM private key loading for RS256 and ES256
//! - Credential minting with audience, issued-at and expiry claims
//! - The [`CredentialMinter`] seam used by the cloud session for rotation
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use toe_auth::{CredentialMinter, KeyFileMinter, SigningAlgorithm};
//! use toe_core::DeviceIdentity;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = DeviceIdentity::new("my-project", "us-central1", "my-registry", "pi-01");
//! let minter = KeyFileMinter::new(
//!     identity,
//!     "/etc/toe/rsa_private.pem",
//!     SigningAlgorithm::Rs256,
//!     Duration::from_secs(24 * 60 * 60),
//! );
//!
//! let credential = minter.mint()?;
//! println!("Token expires at {}", credential.expires_at);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod jwt;

pub use error::{AuthError, Result};
pub use jwt::{
    mint_at, Credential, CredentialMinter, DeviceClaims, KeyFileMinter, SigningAlgorithm,
    SigningKey,
};

#[cfg(any(test, feature = "test-utils"))]
pub use jwt::MockMinter;
