//! toe - device agent entry point.
//!
//! Parses configuration from flags and environment, connects to the local
//! cluster, the cloud bridge and the local bus, then runs until SIGINT or
//! SIGTERM. An update command ends the process immediately with status 0 so
//! the supervisor restarts it.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toe_agent::{Agent, AgentConfig, Collaborators, Exit, MqttConnector};
use toe_cluster::K8sCluster;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,toe=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting toe");
    tracing::info!(
        client_id = %config.identity().client_id(),
        mqtt_host = %config.mqtt_host,
        mqtt_port = config.mqtt_port,
        broker_host = %config.mqtt_broker_host,
        broker_port = config.mqtt_broker_port,
        namespace = %config.namespace,
        algorithm = %config.key_algorithm,
        "Configuration loaded"
    );

    let ca = config.load_ca().map_err(|e| {
        tracing::error!(error = %e, "Cannot load CA bundle");
        e
    })?;

    let cluster = K8sCluster::connect(&config.cluster_config())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Cannot create Kubernetes client");
            e
        })?;
    tracing::info!("Connected to Kubernetes cluster");

    let collaborators = Collaborators {
        cloud: Arc::new(MqttConnector::new()),
        local: Arc::new(MqttConnector::new()),
        minter: Arc::new(config.minter()),
        cluster: Arc::new(cluster),
    };

    let agent = Agent::start(config.settings(ca), collaborators)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, fatal = e.is_fatal_at_startup(), "Agent failed to start");
            e
        })?;

    match agent.run(shutdown_signal()).await {
        Exit::Restart => {
            tracing::warn!("Exiting for restart");
            std::process::exit(0);
        }
        Exit::Shutdown => tracing::info!("Shutdown complete"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
