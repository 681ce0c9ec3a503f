//! The credentialed cloud session.
//!
//! [`CloudSession`] owns the connection to the cloud bridge. The live
//! transport sits behind an async mutex shared by every publish and by
//! rotation. Rotation mints a credential and connects a replacement while
//! holding that mutex, swaps it in, and only then tears the old connection
//! down. A failed rotation leaves the old session in place.
//!
//! The replacement uses the same client id, so the broker drops the old
//! connection as soon as the new one arrives. The old transport is told to
//! hold its reconnects for the duration so it cannot evict the replacement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use toe_auth::{Credential, CredentialMinter};
use toe_cluster::RetryConfig;
use toe_core::{Channel, DeviceIdentity, DeviceState};
use tracing::{debug, info, warn};

use crate::transport::{ConnectOptions, Connector, InboundSender, QoS, Transport};
use crate::Result;

/// Margin between credential rotation and credential expiry.
pub const ROTATION_MARGIN: Duration = Duration::from_secs(10 * 60);

/// Shortest allowed rotation interval.
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(60);

/// How often to rotate credentials that live for `token_lifetime`.
#[must_use]
pub fn rotation_interval(token_lifetime: Duration) -> Duration {
    token_lifetime
        .saturating_sub(ROTATION_MARGIN)
        .max(MIN_ROTATION_INTERVAL)
}

/// Retry policy for a failed rotation: five attempts over a few minutes,
/// all well inside [`ROTATION_MARGIN`].
#[must_use]
pub fn rotation_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_secs(15),
        max_delay: Duration::from_secs(60),
        backoff_multiplier: 2.0,
        jitter: 0.1,
    }
}

struct LiveSession {
    transport: Box<dyn Transport>,
    credential: Credential,
    generation: u64,
}

/// The authenticated connection to the cloud bridge.
pub struct CloudSession {
    identity: DeviceIdentity,
    options: ConnectOptions,
    connector: Arc<dyn Connector>,
    minter: Arc<dyn CredentialMinter>,
    inbound: InboundSender,
    quiesce: Duration,
    live: Mutex<LiveSession>,
}

impl CloudSession {
    /// Mint a credential, connect and subscribe to the control topics.
    ///
    /// `options` is the connection template; its password is replaced by
    /// each minted credential.
    ///
    /// # Errors
    ///
    /// Returns an error if minting, connecting or subscribing fails. All of
    /// these are fatal at startup.
    pub async fn connect(
        identity: DeviceIdentity,
        options: ConnectOptions,
        connector: Arc<dyn Connector>,
        minter: Arc<dyn CredentialMinter>,
        inbound: InboundSender,
        quiesce: Duration,
    ) -> Result<Self> {
        let credential = minter.mint()?;
        let transport =
            Self::open(&identity, &options, connector.as_ref(), &credential, &inbound).await?;

        info!(
            client_id = %options.client_id,
            expires_at = %credential.expires_at,
            "Cloud session established"
        );

        Ok(Self {
            identity,
            options,
            connector,
            minter,
            inbound,
            quiesce,
            live: Mutex::new(LiveSession {
                transport,
                credential,
                generation: 0,
            }),
        })
    }

    /// Topic filters every session subscribes to.
    #[must_use]
    pub fn control_filters(identity: &DeviceIdentity) -> [String; 3] {
        [
            identity.topic(Channel::Config),
            identity.topic(Channel::State),
            Channel::Commands.subtree_filter(&identity.device),
        ]
    }

    async fn open(
        identity: &DeviceIdentity,
        options: &ConnectOptions,
        connector: &dyn Connector,
        credential: &Credential,
        inbound: &InboundSender,
    ) -> Result<Box<dyn Transport>> {
        let options = options.with_password(credential.token.clone());
        let transport = connector.connect(&options, inbound.clone()).await?;

        for filter in Self::control_filters(identity) {
            if let Err(e) = transport.subscribe(&filter, QoS::AtLeastOnce).await {
                if let Err(cleanup) = transport.disconnect(Duration::ZERO).await {
                    debug!(error = %cleanup, "Partially opened session did not disconnect cleanly");
                }
                return Err(e);
            }
            debug!(%filter, "Subscribed");
        }

        Ok(transport)
    }

    /// The device identity this session represents.
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Replace the live session with a freshly credentialed one.
    ///
    /// Publishers block for the duration. The old session is disconnected
    /// only after the new one is connected and subscribed, and does not
    /// reconnect on its own while the replacement is being opened.
    ///
    /// # Errors
    ///
    /// Returns an error if minting or connecting the replacement fails; the
    /// old session stays live in that case.
    pub async fn rotate(&self) -> Result<()> {
        let mut live = self.live.lock().await;
        info!(
            generation = live.generation,
            expires_at = %live.credential.expires_at,
            "Rotating cloud credential"
        );

        let credential = self.minter.mint().map_err(|e| {
            warn!(error = %e, "Credential minting failed, keeping current session");
            e
        })?;

        live.transport.hold_reconnect(true);
        let transport = Self::open(
            &self.identity,
            &self.options,
            self.connector.as_ref(),
            &credential,
            &self.inbound,
        )
        .await
        .map_err(|e| {
            live.transport.hold_reconnect(false);
            warn!(error = %e, "Replacement session failed, keeping current session");
            e
        })?;

        let generation = live.generation + 1;
        let old = std::mem::replace(
            &mut *live,
            LiveSession {
                transport,
                credential,
                generation,
            },
        );

        if let Err(e) = old.transport.disconnect(self.quiesce).await {
            debug!(error = %e, "Old session did not disconnect cleanly");
        }

        info!(
            generation,
            expires_at = %live.credential.expires_at,
            "Cloud credential rotated"
        );
        Ok(())
    }

    /// Publish at-least-once on the live session.
    ///
    /// # Errors
    ///
    /// Returns the transport error unchanged; there is no retry.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let live = self.live.lock().await;
        live.transport
            .publish(topic, payload, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                warn!(%topic, error = %e, "Cloud publish failed");
                e
            })
    }

    /// Publish a device state snapshot on the state channel.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub async fn publish_state(&self, state: &DeviceState) -> Result<()> {
        let payload = state.to_payload()?;
        self.publish(&self.identity.topic(Channel::State), &payload)
            .await
    }

    /// Publish a telemetry event payload unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing fails.
    pub async fn publish_event(&self, payload: &[u8]) -> Result<()> {
        self.publish(&self.identity.topic(Channel::Events), payload)
            .await
    }

    /// Number of completed rotations.
    pub async fn generation(&self) -> u64 {
        self.live.lock().await.generation
    }

    /// Disconnect the live session.
    ///
    /// # Errors
    ///
    /// Returns an error if the disconnect request fails.
    pub async fn disconnect(&self) -> Result<()> {
        let live = self.live.lock().await;
        info!(generation = live.generation, "Disconnecting cloud session");
        live.transport.disconnect(self.quiesce).await
    }
}
