//! Agent lifecycle.
//!
//! [`Agent::start`] establishes both bus connections and wires the
//! collaborators together. [`Agent::run`] then drives four concurrent duties
//! until shutdown or a restart request:
//!
//! - credential rotation on a timer,
//! - state heartbeat on a timer,
//! - the cloud receive loop,
//! - the local bus receive loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use toe_auth::CredentialMinter;
use toe_cluster::{retry_when, ClusterApi, Reconciler, RetryConfig};
use toe_core::DeviceIdentity;
use tracing::{debug, error, info, warn};

use crate::bus::LocalBus;
use crate::demux::{Demultiplexer, LoopExit};
use crate::session::CloudSession;
use crate::state::StateAggregator;
use crate::transport::{ConnectOptions, Connector, InboundReceiver};
use crate::Result;

/// Runtime settings of the agent.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Device identity on the cloud bridge.
    pub identity: DeviceIdentity,
    /// Namespace of the managed deployments.
    pub namespace: String,
    /// Cloud connection template; the password is minted per session.
    pub cloud: ConnectOptions,
    /// Local bus connection options.
    pub local: ConnectOptions,
    /// Interval between state publishes.
    pub heartbeat_interval: Duration,
    /// Interval between credential rotations.
    pub rotation_interval: Duration,
    /// Retry policy for a failed rotation.
    pub rotation_retry: RetryConfig,
    /// Grace period for in-flight work on disconnect.
    pub quiesce: Duration,
    /// Retry policy for update conflicts.
    pub conflict_retry: RetryConfig,
}

/// External systems the agent talks to.
pub struct Collaborators {
    /// Connector for the cloud bridge.
    pub cloud: Arc<dyn Connector>,
    /// Connector for the local bus.
    pub local: Arc<dyn Connector>,
    /// Source of cloud credentials.
    pub minter: Arc<dyn CredentialMinter>,
    /// The cluster API.
    pub cluster: Arc<dyn ClusterApi>,
}

/// How [`Agent::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Shutdown was requested and both sessions were disconnected.
    Shutdown,
    /// An update command asked for a restart. Nothing was torn down.
    Restart,
}

/// A connected agent.
pub struct Agent {
    settings: AgentSettings,
    session: Arc<CloudSession>,
    local: Arc<LocalBus>,
    state: Arc<StateAggregator>,
    demux: Arc<Demultiplexer>,
    cloud_inbound: InboundReceiver,
    local_inbound: InboundReceiver,
}

impl Agent {
    /// Connect both buses and publish the initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if minting the first credential or connecting
    /// either bus fails. A failed initial state publish is only logged.
    pub async fn start(settings: AgentSettings, parts: Collaborators) -> Result<Self> {
        let (cloud_tx, cloud_inbound) = mpsc::unbounded_channel();
        let session = Arc::new(
            CloudSession::connect(
                settings.identity.clone(),
                settings.cloud.clone(),
                parts.cloud,
                parts.minter,
                cloud_tx,
                settings.quiesce,
            )
            .await?,
        );

        let state = Arc::new(StateAggregator::new(parts.cluster.clone()));
        publish_state(&session, &state).await;

        let (local_tx, local_inbound) = mpsc::unbounded_channel();
        let local = Arc::new(
            LocalBus::connect(parts.local, &settings.local, local_tx, settings.quiesce).await?,
        );

        let reconciler = Arc::new(Reconciler::new(
            parts.cluster,
            settings.conflict_retry.clone(),
        ));
        let demux = Arc::new(Demultiplexer::new(
            &settings.namespace,
            session.clone(),
            local.clone(),
            reconciler,
            state.clone(),
        ));

        info!(
            device = %settings.identity.device,
            namespace = %settings.namespace,
            "Agent started"
        );

        Ok(Self {
            settings,
            session,
            local,
            state,
            demux,
            cloud_inbound,
            local_inbound,
        })
    }

    /// The cloud session.
    #[must_use]
    pub const fn session(&self) -> &Arc<CloudSession> {
        &self.session
    }

    /// The device state owner.
    #[must_use]
    pub const fn state(&self) -> &Arc<StateAggregator> {
        &self.state
    }

    /// Run until `shutdown` resolves or a restart is requested.
    ///
    /// On shutdown the timers and receive loops are stopped, any message
    /// being handled is finished, the final state is published and both
    /// sessions are disconnected. On restart the method returns at once.
    pub async fn run<F>(self, shutdown: F) -> Exit
    where
        F: Future<Output = ()>,
    {
        let Self {
            settings,
            session,
            local,
            state,
            demux,
            cloud_inbound,
            local_inbound,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);

        let rotation = tokio::spawn(rotation_loop(
            session.clone(),
            settings.rotation_interval,
            settings.rotation_retry.clone(),
            stop_rx.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            session.clone(),
            state.clone(),
            settings.heartbeat_interval,
            stop_rx.clone(),
        ));
        let local_loop = tokio::spawn({
            let demux = demux.clone();
            let stop = stop_rx.clone();
            async move { demux.run_local(local_inbound, stop).await }
        });
        let mut cloud_loop = tokio::spawn({
            let demux = demux.clone();
            async move { demux.run_cloud(cloud_inbound, stop_rx).await }
        });

        tokio::pin!(shutdown);
        let cloud_finished = tokio::select! {
            exit = &mut cloud_loop => Some(exit),
            () = &mut shutdown => None,
        };

        let cloud_done = cloud_finished.is_some();
        match cloud_finished {
            Some(Ok(LoopExit::Restart)) => {
                rotation.abort();
                heartbeat.abort();
                local_loop.abort();
                return Exit::Restart;
            }
            Some(Ok(exit)) => warn!(?exit, "Cloud receive loop ended, shutting down"),
            Some(Err(e)) => error!(error = %e, "Cloud receive loop failed, shutting down"),
            None => info!("Shutdown requested"),
        }

        let _ = stop_tx.send(true);
        let (rotation, heartbeat, local_loop) = tokio::join!(rotation, heartbeat, local_loop);
        for (task, result) in [("rotation", rotation), ("heartbeat", heartbeat)] {
            if let Err(e) = result {
                warn!(task, error = %e, "Task did not stop cleanly");
            }
        }
        if let Err(e) = local_loop {
            warn!(task = "local", error = %e, "Task did not stop cleanly");
        }
        if !cloud_done {
            if let Ok(exit) = cloud_loop.await {
                debug!(?exit, "Cloud receive loop stopped");
            }
        }

        let snapshot = match state.refresh_workload_statuses().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Workload status refresh failed, publishing last known state");
                state.snapshot()
            }
        };
        if let Err(e) = session.publish_state(&snapshot).await {
            warn!(error = %e, "Final state publish failed");
        }
        if let Err(e) = session.disconnect().await {
            warn!(error = %e, "Cloud session did not disconnect cleanly");
        }
        if let Err(e) = local.disconnect().await {
            warn!(error = %e, "Local bus did not disconnect cleanly");
        }

        info!("Agent stopped");
        Exit::Shutdown
    }
}

/// Refresh workload statuses and publish the state.
///
/// If the refresh fails nothing is published; the next heartbeat retries.
async fn publish_state(session: &CloudSession, state: &StateAggregator) {
    let snapshot = match state.refresh_workload_statuses().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Workload status refresh failed, skipping state publish");
            return;
        }
    };

    match session.publish_state(&snapshot).await {
        Ok(()) => debug!(apps = snapshot.apps.len(), "State published"),
        Err(e) => warn!(error = %e, "State publish failed"),
    }
}

fn ticker(period: Duration) -> time::Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Rotate every `period`, retrying a failed rotation under `retry`.
///
/// The next period counts from the last successful rotation. When every
/// retry fails the old session stays live and rotation is attempted again
/// after `retry.max_delay`.
async fn rotation_loop(
    session: Arc<CloudSession>,
    period: Duration,
    retry: RetryConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let rotated = tokio::select! {
            biased;
            _ = stop.changed() => break,
            result = retry_when(&retry, "rotate credential", |_| true, || session.rotate()) => result,
        };
        match rotated {
            Ok(()) => ticker.reset(),
            Err(e) => {
                error!(
                    error = %e,
                    attempts = retry.max_attempts,
                    "Credential rotation failed, keeping current session"
                );
                ticker.reset_after(retry.max_delay);
            }
        }
    }
}

async fn heartbeat_loop(
    session: Arc<CloudSession>,
    state: Arc<StateAggregator>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => publish_state(&session, &state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;
    use tokio::sync::oneshot;
    use toe_auth::MockMinter;
    use toe_cluster::{ContainerReport, MockCluster};

    const STATE_TOPIC: &str = "/devices/dev-1/state";

    struct Fixture {
        cloud: Arc<MockConnector>,
        local: Arc<MockConnector>,
        cluster: Arc<MockCluster>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                cloud: Arc::new(MockConnector::new()),
                local: Arc::new(MockConnector::new()),
                cluster: Arc::new(MockCluster::new()),
            }
        }

        fn settings() -> AgentSettings {
            let identity = DeviceIdentity::new("proj", "us-central1", "reg", "dev-1");
            AgentSettings {
                cloud: ConnectOptions::new(identity.client_id(), "mqtt.example.com", 8883),
                local: ConnectOptions::new("toe", "hmq", 1883),
                identity,
                namespace: "default".to_string(),
                heartbeat_interval: Duration::from_secs(60),
                rotation_interval: Duration::from_secs(600),
                rotation_retry: RetryConfig {
                    max_attempts: 3,
                    initial_delay: Duration::from_secs(30),
                    max_delay: Duration::from_secs(60),
                    backoff_multiplier: 2.0,
                    jitter: 0.0,
                },
                quiesce: Duration::ZERO,
                conflict_retry: RetryConfig::immediate(3),
            }
        }

        async fn start(&self) -> Result<Agent> {
            Agent::start(
                Self::settings(),
                Collaborators {
                    cloud: self.cloud.clone(),
                    local: self.local.clone(),
                    minter: Arc::new(MockMinter::new()),
                    cluster: self.cluster.clone(),
                },
            )
            .await
        }
    }

    #[tokio::test]
    async fn start_connects_both_buses_and_publishes_state() {
        let fixture = Fixture::new();
        fixture.cluster.set_containers(vec![ContainerReport {
            name: "web".to_string(),
            image: "nginx:1.25".to_string(),
            restarts: 0,
            condition: "running".to_string(),
        }]);

        let agent = fixture.start().await.unwrap();

        assert_eq!(fixture.cloud.connects().len(), 1);
        assert_eq!(fixture.local.subscriptions(0), ["toe/events", "toe/location"]);
        let published = fixture.cloud.published_to(STATE_TOPIC);
        assert_eq!(published.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(value["apps"]["web"]["version"], "nginx:1.25");
        assert!(agent.state().snapshot().apps.contains_key("web"));
    }

    #[tokio::test]
    async fn cloud_connect_failure_aborts_start() {
        let fixture = Fixture::new();
        fixture.cloud.fail_next_connect();

        let err = fixture.start().await.err().unwrap();
        assert!(err.is_fatal_at_startup());
        assert_eq!(fixture.local.attempts(), 0);
    }

    #[tokio::test]
    async fn local_connect_failure_aborts_start() {
        let fixture = Fixture::new();
        fixture.local.fail_next_connect();

        let err = fixture.start().await.err().unwrap();
        assert!(err.is_fatal_at_startup());
    }

    #[tokio::test]
    async fn failed_initial_refresh_is_not_fatal() {
        let fixture = Fixture::new();
        fixture.cluster.fail_list(true);

        assert!(fixture.start().await.is_ok());
        assert!(fixture.cloud.published_to(STATE_TOPIC).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_publishes_on_interval() {
        let fixture = Fixture::new();
        let agent = fixture.start().await.unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let run = tokio::spawn(agent.run(async {
            let _ = stopped.await;
        }));

        time::sleep(Duration::from_secs(150)).await;
        assert_eq!(fixture.cloud.published_to(STATE_TOPIC).len(), 3);

        stop.send(()).unwrap();
        assert_eq!(run.await.unwrap(), Exit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_rotate_on_interval() {
        let fixture = Fixture::new();
        let agent = fixture.start().await.unwrap();
        let session = agent.session().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let run = tokio::spawn(agent.run(async {
            let _ = stopped.await;
        }));

        time::sleep(Duration::from_secs(1500)).await;
        assert_eq!(session.generation().await, 2);
        assert_eq!(fixture.cloud.disconnected(), [0, 1]);

        stop.send(()).unwrap();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rotation_is_retried_before_expiry() {
        let fixture = Fixture::new();
        let agent = fixture.start().await.unwrap();
        let session = agent.session().clone();
        fixture.cloud.fail_next_connect();
        let (stop, stopped) = oneshot::channel::<()>();
        let run = tokio::spawn(agent.run(async {
            let _ = stopped.await;
        }));

        // Rotation fails at 600s and is retried 30s later, long before the
        // 1200s credential lifetime runs out.
        time::sleep(Duration::from_secs(700)).await;
        assert_eq!(fixture.cloud.attempts(), 3);
        assert_eq!(session.generation().await, 1);
        assert_eq!(fixture.cloud.disconnected(), [0]);

        // The next rotation counts from the successful retry at 630s.
        time::sleep(Duration::from_secs(520)).await;
        assert_eq!(session.generation().await, 1);
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(session.generation().await, 2);

        stop.send(()).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_publishes_final_state_and_disconnects() {
        let fixture = Fixture::new();
        let agent = fixture.start().await.unwrap();

        let exit = agent.run(async {}).await;

        assert_eq!(exit, Exit::Shutdown);
        assert_eq!(fixture.cloud.published_to(STATE_TOPIC).len(), 2);
        assert_eq!(fixture.cloud.disconnected(), [0]);
        assert_eq!(fixture.local.disconnected(), [0]);
    }

    #[tokio::test]
    async fn final_state_reflects_current_workloads() {
        let fixture = Fixture::new();
        let agent = fixture.start().await.unwrap();
        fixture.cluster.set_containers(vec![ContainerReport {
            name: "sensor".to_string(),
            image: "acme/sensor:2".to_string(),
            restarts: 3,
            condition: "running".to_string(),
        }]);

        agent.run(async {}).await;

        let published = fixture.cloud.published_to(STATE_TOPIC);
        let last: serde_json::Value =
            serde_json::from_slice(&published.last().unwrap().payload).unwrap();
        assert_eq!(last["apps"]["sensor"]["restarts"], 3);
    }

    #[tokio::test]
    async fn final_state_falls_back_to_last_snapshot() {
        let fixture = Fixture::new();
        fixture.cluster.set_containers(vec![ContainerReport {
            name: "web".to_string(),
            image: "nginx:1.25".to_string(),
            restarts: 0,
            condition: "running".to_string(),
        }]);
        let agent = fixture.start().await.unwrap();
        fixture.cluster.fail_list(true);

        agent.run(async {}).await;

        let published = fixture.cloud.published_to(STATE_TOPIC);
        assert_eq!(published.len(), 2);
        let last: serde_json::Value = serde_json::from_slice(&published[1].payload).unwrap();
        assert_eq!(last["apps"]["web"]["version"], "nginx:1.25");
    }

    #[tokio::test]
    async fn update_command_requests_restart_without_teardown() {
        let fixture = Fixture::new();
        let agent = fixture.start().await.unwrap();

        assert!(fixture
            .cloud
            .deliver("/devices/dev-1/commands", br#"{"command":"update"}"#));
        let exit = agent.run(std::future::pending()).await;

        assert_eq!(exit, Exit::Restart);
        assert!(fixture.cloud.disconnected().is_empty());
        assert!(fixture.local.disconnected().is_empty());
    }
}
