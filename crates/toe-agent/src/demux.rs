//! Routing between the cloud session, the local bus and the reconciler.
//!
//! Routes are data: a [`RouteTable`] maps topic patterns to [`Route`]
//! variants, and the demultiplexer acts on the variant. Every message is
//! handled independently; a failure is logged and never affects the next
//! message.

use std::sync::Arc;

use tokio::sync::watch;
use toe_cluster::{decode_manifest, ReconcileReport, Reconciler};
use toe_core::{
    local_command_topic, Channel, CommandMessage, DeviceIdentity, LocationMessage,
    LOCAL_EVENTS_TOPIC, LOCAL_LOCATION_TOPIC,
};
use tracing::{debug, info, warn};

use crate::bus::LocalBus;
use crate::session::CloudSession;
use crate::state::StateAggregator;
use crate::transport::{InboundMessage, InboundReceiver};
use crate::Result;

/// What an inbound message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Desired workload manifest on the config channel.
    Config,
    /// Echo of our own state publish.
    StateEcho,
    /// Command addressed to the agent on the bare commands topic.
    Command,
    /// Sub-command to forward onto the local bus.
    SubCommand,
    /// Local event to forward to the cloud as telemetry.
    LocalEvent,
    /// Local location update.
    LocalLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicPattern {
    Exact(String),
    Below(String),
}

impl TopicPattern {
    fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(t) => topic == t,
            Self::Below(prefix) => topic
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|rest| !rest.is_empty()),
        }
    }
}

/// Ordered topic pattern to route mapping; the first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<(TopicPattern, Route)>,
}

impl RouteTable {
    /// Routes for messages arriving from the cloud bridge.
    #[must_use]
    pub fn cloud(identity: &DeviceIdentity) -> Self {
        let commands = identity.topic(Channel::Commands);
        Self {
            routes: vec![
                (TopicPattern::Exact(identity.topic(Channel::Config)), Route::Config),
                (TopicPattern::Exact(identity.topic(Channel::State)), Route::StateEcho),
                (TopicPattern::Exact(commands.clone()), Route::Command),
                (TopicPattern::Below(commands), Route::SubCommand),
            ],
        }
    }

    /// Routes for messages arriving from the local bus.
    #[must_use]
    pub fn local() -> Self {
        Self {
            routes: vec![
                (TopicPattern::Exact(LOCAL_EVENTS_TOPIC.to_string()), Route::LocalEvent),
                (
                    TopicPattern::Exact(LOCAL_LOCATION_TOPIC.to_string()),
                    Route::LocalLocation,
                ),
            ],
        }
    }

    /// The route for `topic`, if any.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> Option<Route> {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.matches(topic))
            .map(|(_, route)| *route)
    }
}

/// What handling a message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// A manifest was reconciled.
    Reconciled(ReconcileReport),
    /// The agent was asked to restart.
    Restart,
    /// A sub-command was republished on the local bus.
    Forwarded {
        /// Local topic it was published on.
        topic: String,
    },
    /// A local event was published as cloud telemetry.
    Telemetry,
    /// The device location was updated.
    LocationUpdated,
    /// Our own state publish came back.
    StateEcho,
    /// Nothing to do.
    Ignored,
}

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The inbound channel closed.
    Closed,
    /// The agent is shutting down.
    Stopped,
    /// An update command requested a restart.
    Restart,
}

/// Dispatches inbound messages from both buses.
pub struct Demultiplexer {
    identity: DeviceIdentity,
    namespace: String,
    cloud_routes: RouteTable,
    local_routes: RouteTable,
    session: Arc<CloudSession>,
    local: Arc<LocalBus>,
    reconciler: Arc<Reconciler>,
    state: Arc<StateAggregator>,
}

impl Demultiplexer {
    /// Create a demultiplexer over the given collaborators.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        session: Arc<CloudSession>,
        local: Arc<LocalBus>,
        reconciler: Arc<Reconciler>,
        state: Arc<StateAggregator>,
    ) -> Self {
        let identity = session.identity().clone();
        Self {
            cloud_routes: RouteTable::cloud(&identity),
            local_routes: RouteTable::local(),
            identity,
            namespace: namespace.into(),
            session,
            local,
            reconciler,
            state,
        }
    }

    /// Handle a message received from the cloud bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed or the resulting
    /// action fails.
    pub async fn handle_cloud(&self, message: &InboundMessage) -> Result<Disposition> {
        let route = self.cloud_routes.resolve(&message.topic);
        self.dispatch(route, message).await
    }

    /// Handle a message received from the local bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed or the resulting
    /// action fails.
    pub async fn handle_local(&self, message: &InboundMessage) -> Result<Disposition> {
        let route = self.local_routes.resolve(&message.topic);
        self.dispatch(route, message).await
    }

    async fn dispatch(&self, route: Option<Route>, message: &InboundMessage) -> Result<Disposition> {
        let topic = message.topic.as_str();
        let payload = message.payload.as_slice();

        match route {
            Some(Route::Config) => {
                let desired = decode_manifest(payload, &self.namespace)?;
                info!(%topic, workloads = desired.len(), "Received desired manifest");
                let report = self.reconciler.reconcile(&desired).await?;
                Ok(Disposition::Reconciled(report))
            }
            Some(Route::StateEcho) => {
                debug!(%topic, payload = %String::from_utf8_lossy(payload), "State echo");
                Ok(Disposition::StateEcho)
            }
            Some(Route::Command) => {
                let command = CommandMessage::decode(payload)?;
                if command.is_update() {
                    warn!("Received update command, restarting");
                    Ok(Disposition::Restart)
                } else {
                    info!(command = %command.command, "Ignoring unrecognized command");
                    Ok(Disposition::Ignored)
                }
            }
            Some(Route::SubCommand) => {
                let local_topic = local_command_topic(&self.identity.device, topic)?;
                self.local.forward(&local_topic, payload).await?;
                info!(from = %topic, to = %local_topic, "Forwarded command to local bus");
                Ok(Disposition::Forwarded { topic: local_topic })
            }
            Some(Route::LocalEvent) => {
                self.session.publish_event(payload).await?;
                debug!(bytes = payload.len(), "Forwarded local event to cloud");
                Ok(Disposition::Telemetry)
            }
            Some(Route::LocalLocation) => {
                let update = LocationMessage::decode(payload)?;
                self.state.update_location(&update);
                Ok(Disposition::LocationUpdated)
            }
            None => {
                debug!(%topic, "No route for message");
                Ok(Disposition::Ignored)
            }
        }
    }

    /// Handle cloud messages until the channel closes, `stop` fires, or a
    /// restart is requested.
    ///
    /// Config messages are handled one at a time; a manifest arriving
    /// mid-pass waits in the channel until the current pass is done. A
    /// message being handled when `stop` fires is finished first.
    pub async fn run_cloud(
        &self,
        mut inbound: InboundReceiver,
        mut stop: watch::Receiver<bool>,
    ) -> LoopExit {
        loop {
            let message = tokio::select! {
                biased;
                _ = stop.changed() => return LoopExit::Stopped,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => return LoopExit::Closed,
                },
            };

            match self.handle_cloud(&message).await {
                Ok(Disposition::Restart) => return LoopExit::Restart,
                Ok(disposition) => log_disposition(&message.topic, &disposition),
                Err(e) => warn!(topic = %message.topic, error = %e, "Dropped cloud message"),
            }
        }
    }

    /// Handle local bus messages until the channel closes or `stop` fires.
    pub async fn run_local(
        &self,
        mut inbound: InboundReceiver,
        mut stop: watch::Receiver<bool>,
    ) -> LoopExit {
        loop {
            let message = tokio::select! {
                biased;
                _ = stop.changed() => return LoopExit::Stopped,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => return LoopExit::Closed,
                },
            };

            match self.handle_local(&message).await {
                Ok(disposition) => log_disposition(&message.topic, &disposition),
                Err(e) => warn!(topic = %message.topic, error = %e, "Dropped local message"),
            }
        }
    }
}

fn log_disposition(topic: &str, disposition: &Disposition) {
    debug!(%topic, ?disposition, "Message handled");
}
