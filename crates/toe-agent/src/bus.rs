//! Connection to the on-device message bus.

use std::sync::Arc;
use std::time::Duration;

use toe_core::{LOCAL_EVENTS_TOPIC, LOCAL_LOCATION_TOPIC};
use tracing::{debug, info, warn};

use crate::transport::{ConnectOptions, Connector, InboundSender, QoS, Transport};
use crate::Result;

/// Local topics the agent listens on.
pub const LOCAL_FILTERS: [&str; 2] = [LOCAL_EVENTS_TOPIC, LOCAL_LOCATION_TOPIC];

/// The local bus connection.
///
/// Unlike the cloud session it is never rotated; reconnects are left to the
/// transport.
pub struct LocalBus {
    transport: Box<dyn Transport>,
    quiesce: Duration,
}

impl LocalBus {
    /// Connect and subscribe to the local event and location topics.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or subscribing fails.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        options: &ConnectOptions,
        inbound: InboundSender,
        quiesce: Duration,
    ) -> Result<Self> {
        let transport = connector.connect(options, inbound).await?;
        for filter in LOCAL_FILTERS {
            transport.subscribe(filter, QoS::AtMostOnce).await?;
            debug!(%filter, "Subscribed on local bus");
        }
        info!(broker = %options.address(), "Local bus connected");

        Ok(Self { transport, quiesce })
    }

    /// Publish a forwarded message at-least-once.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the publish fails.
    pub async fn forward(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.transport
            .publish(topic, payload, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                warn!(%topic, error = %e, "Local publish failed");
                e
            })
    }

    /// Disconnect from the local broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the disconnect request fails.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting local bus");
        self.transport.disconnect(self.quiesce).await
    }
}
