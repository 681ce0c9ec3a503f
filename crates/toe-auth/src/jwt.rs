//! JWT minting for the cloud session.
//!
//! The cloud bridge authenticates devices with a short-lived JWT passed as
//! the MQTT password. The claim set is minimal: the project id as audience,
//! plus issued-at and expiry timestamps.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use toe_core::DeviceIdentity;

use crate::error::{AuthError, Result};

/// A signed bearer token with its validity window.
///
/// Credentials are never mutated; rotation mints a new one.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// The compact-serialized JWT.
    pub token: String,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the token stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the credential has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Claims carried by a device JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClaims {
    /// Audience (the cloud project id).
    pub aud: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Asymmetric signing algorithms accepted by the cloud bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    #[default]
    Rs256,
    /// ECDSA on P-256 with SHA-256.
    Es256,
}

impl SigningAlgorithm {
    const fn jwt_algorithm(self) -> Algorithm {
        match self {
            Self::Rs256 => Algorithm::RS256,
            Self::Es256 => Algorithm::ES256,
        }
    }
}

impl FromStr for SigningAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rs256" | "rsa256" => Ok(Self::Rs256),
            "es256" => Ok(Self::Es256),
            other => Err(format!("unsupported signing algorithm: {other}")),
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rs256 => f.write_str("RS256"),
            Self::Es256 => f.write_str("ES256"),
        }
    }
}

/// A parsed private key ready for signing.
pub struct SigningKey {
    algorithm: SigningAlgorithm,
    key: EncodingKey,
}

impl SigningKey {
    /// Parse a PEM-encoded private key.
    ///
    /// RSA keys may be PKCS#1 or PKCS#8; EC keys must be PKCS#8.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedKey`] if the PEM cannot be parsed for
    /// the requested algorithm.
    pub fn from_pem(pem: &[u8], algorithm: SigningAlgorithm) -> Result<Self> {
        Self::parse(pem, algorithm, Path::new("<memory>"))
    }

    /// Read and parse a PEM private key from disk.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyLoad`] if the file cannot be read and
    /// [`AuthError::MalformedKey`] if it cannot be parsed.
    pub fn from_pem_file(path: &Path, algorithm: SigningAlgorithm) -> Result<Self> {
        tracing::debug!(path = %path.display(), %algorithm, "Loading signing key");
        let pem = std::fs::read(path).map_err(|source| AuthError::KeyLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&pem, algorithm, path)
    }

    fn parse(pem: &[u8], algorithm: SigningAlgorithm, path: &Path) -> Result<Self> {
        let key = match algorithm {
            SigningAlgorithm::Rs256 => EncodingKey::from_rsa_pem(pem),
            SigningAlgorithm::Es256 => EncodingKey::from_ec_pem(pem),
        }
        .map_err(|e| AuthError::MalformedKey {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Self { algorithm, key })
    }

    /// The algorithm this key signs with.
    #[must_use]
    pub const fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }
}

/// Mint a credential for `identity` valid for `validity` starting at `now`.
///
/// # Errors
///
/// Returns [`AuthError::InvalidValidity`] if the validity overflows and
/// [`AuthError::Signing`] if the encoder rejects the claims.
pub fn mint_at(
    identity: &DeviceIdentity,
    key: &SigningKey,
    validity: Duration,
    now: DateTime<Utc>,
) -> Result<Credential> {
    let lifetime = chrono::Duration::from_std(validity)
        .map_err(|e| AuthError::InvalidValidity(e.to_string()))?;
    let expires_at = now
        .checked_add_signed(lifetime)
        .ok_or_else(|| AuthError::InvalidValidity(format!("{validity:?} overflows")))?;

    let claims = DeviceClaims {
        aud: identity.audience().to_string(),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };

    let header = Header::new(key.algorithm.jwt_algorithm());
    let token = encode(&header, &claims, &key.key).map_err(|e| AuthError::Signing(e.to_string()))?;

    Ok(Credential {
        token,
        issued_at: now,
        expires_at,
    })
}

/// Source of fresh credentials for the cloud session.
///
/// Implementations must be callable concurrently; the session serializes
/// rotation itself.
pub trait CredentialMinter: Send + Sync {
    /// Mint a new credential valid from now.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be loaded or signing fails.
    fn mint(&self) -> Result<Credential>;
}

/// Mints credentials from a private key file on disk.
///
/// The key is re-read for every credential so that a key replaced on disk
/// takes effect at the next rotation.
#[derive(Debug, Clone)]
pub struct KeyFileMinter {
    identity: DeviceIdentity,
    key_path: PathBuf,
    algorithm: SigningAlgorithm,
    validity: Duration,
}

impl KeyFileMinter {
    /// Create a minter for the given identity and key file.
    #[must_use]
    pub fn new(
        identity: DeviceIdentity,
        key_path: impl Into<PathBuf>,
        algorithm: SigningAlgorithm,
        validity: Duration,
    ) -> Self {
        Self {
            identity,
            key_path: key_path.into(),
            algorithm,
            validity,
        }
    }

    /// Lifetime of every minted credential.
    #[must_use]
    pub const fn validity(&self) -> Duration {
        self.validity
    }

    /// Mint a credential as of `now`.
    ///
    /// # Errors
    ///
    /// See [`SigningKey::from_pem_file`] and [`mint_at`].
    pub fn mint_at(&self, now: DateTime<Utc>) -> Result<Credential> {
        let key = SigningKey::from_pem_file(&self.key_path, self.algorithm)?;
        mint_at(&self.identity, &key, self.validity, now)
    }
}

impl CredentialMinter for KeyFileMinter {
    fn mint(&self) -> Result<Credential> {
        let credential = self.mint_at(Utc::now())?;
        tracing::info!(
            audience = %self.identity.audience(),
            expires_at = %credential.expires_at,
            "Minted device credential"
        );
        Ok(credential)
    }
}

/// A minter for tests that issues opaque numbered tokens.
///
/// Tokens have the form `test-credential-<n>`; the minter can be told to
/// fail the next call.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct MockMinter {
    issued: std::sync::atomic::AtomicUsize,
    fail_next: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockMinter {
    /// Create a new mock minter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `mint` call fail with a signing error.
    pub fn fail_next(&self) {
        self.fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of credentials minted so far.
    #[must_use]
    pub fn issued(&self) -> usize {
        self.issued.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl CredentialMinter for MockMinter {
    fn mint(&self) -> Result<Credential> {
        use std::sync::atomic::Ordering;

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AuthError::Signing("mock failure".to_string()));
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        Ok(Credential {
            token: format!("test-credential-{n}"),
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    const RSA_PRIVATE: &[u8] = include_bytes!("../tests/fixtures/rsa_private.pem");
    const RSA_PUBLIC: &[u8] = include_bytes!("../tests/fixtures/rsa_public.pem");
    const EC_PRIVATE: &[u8] = include_bytes!("../tests/fixtures/ec_private.pem");
    const EC_PUBLIC: &[u8] = include_bytes!("../tests/fixtures/ec_public.pem");

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("toe-project", "us-central1", "fleet", "pi-7")
    }

    #[test]
    fn rs256_claims_round_trip() {
        let key = SigningKey::from_pem(RSA_PRIVATE, SigningAlgorithm::Rs256).unwrap();
        let now = Utc::now();
        let credential = mint_at(&identity(), &key, Duration::from_secs(3600), now).unwrap();

        assert_eq!(credential.issued_at, now);
        assert_eq!(
            credential.expires_at - credential.issued_at,
            chrono::Duration::hours(1)
        );

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["toe-project"]);
        let data = decode::<DeviceClaims>(
            &credential.token,
            &DecodingKey::from_rsa_pem(RSA_PUBLIC).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(data.claims.aud, "toe-project");
        assert_eq!(data.claims.iat, now.timestamp());
        assert_eq!(data.claims.exp, now.timestamp() + 3600);
    }

    #[test]
    fn es256_signs_verifiably() {
        let key = SigningKey::from_pem(EC_PRIVATE, SigningAlgorithm::Es256).unwrap();
        assert_eq!(key.algorithm(), SigningAlgorithm::Es256);

        let credential = mint_at(&identity(), &key, Duration::from_secs(600), Utc::now()).unwrap();

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&["toe-project"]);
        decode::<DeviceClaims>(
            &credential.token,
            &DecodingKey::from_ec_pem(EC_PUBLIC).unwrap(),
            &validation,
        )
        .unwrap();
    }

    #[test]
    fn garbage_pem_is_malformed() {
        let err = SigningKey::from_pem(b"not a key", SigningAlgorithm::Rs256)
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::MalformedKey { .. }));
        assert!(err.is_key_error());
    }

    #[test]
    fn missing_key_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let minter = KeyFileMinter::new(
            identity(),
            dir.path().join("missing.pem"),
            SigningAlgorithm::Rs256,
            Duration::from_secs(60),
        );

        let err = minter.mint().unwrap_err();
        assert!(matches!(err, AuthError::KeyLoad { .. }));
    }

    #[test]
    fn key_file_minter_rereads_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.pem");
        std::fs::write(&path, RSA_PRIVATE).unwrap();

        let minter = KeyFileMinter::new(
            identity(),
            &path,
            SigningAlgorithm::Rs256,
            Duration::from_secs(60),
        );
        assert!(minter.mint().is_ok());

        std::fs::write(&path, b"corrupted").unwrap();
        assert!(matches!(
            minter.mint().unwrap_err(),
            AuthError::MalformedKey { .. }
        ));
    }

    #[test]
    fn credential_expiry() {
        let key = SigningKey::from_pem(RSA_PRIVATE, SigningAlgorithm::Rs256).unwrap();
        let now = Utc::now();
        let credential = mint_at(&identity(), &key, Duration::from_secs(10), now).unwrap();

        assert!(!credential.is_expired_at(now));
        assert!(credential.is_expired_at(now + chrono::Duration::seconds(10)));
        assert!(!format!("{credential:?}").contains(&credential.token));
    }

    #[test]
    fn algorithm_parsing() {
        assert_eq!("RS256".parse::<SigningAlgorithm>(), Ok(SigningAlgorithm::Rs256));
        assert_eq!("rsa256".parse::<SigningAlgorithm>(), Ok(SigningAlgorithm::Rs256));
        assert_eq!("es256".parse::<SigningAlgorithm>(), Ok(SigningAlgorithm::Es256));
        assert!("hs256".parse::<SigningAlgorithm>().is_err());
    }

    #[test]
    fn mock_minter_numbers_tokens() {
        let minter = MockMinter::new();
        assert_eq!(minter.mint().unwrap().token, "test-credential-1");
        minter.fail_next();
        assert!(minter.mint().is_err());
        assert_eq!(minter.mint().unwrap().token, "test-credential-2");
        assert_eq!(minter.issued(), 2);
    }
}
