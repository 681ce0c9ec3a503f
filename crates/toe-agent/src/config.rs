//! Agent configuration.
//!
//! Every option can be given as a flag or an environment variable and has a
//! fixed default; a flag beats the variable, which beats the default.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use toe_auth::{KeyFileMinter, SigningAlgorithm};
use toe_cluster::ClusterConfig;
use toe_core::DeviceIdentity;

use crate::agent::AgentSettings;
use crate::session::{rotation_interval, rotation_retry};
use crate::transport::ConnectOptions;
use crate::{AgentError, Result};

/// Username sent to the cloud bridge, which only checks the password.
pub const CLOUD_USERNAME: &str = "unused";

/// Client id on the local bus.
pub const LOCAL_CLIENT_ID: &str = "toe";

/// Keep-alive for both connections.
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Bound on connect and acknowledgment waits.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for in-flight work when disconnecting.
pub const DISCONNECT_QUIESCE: Duration = Duration::from_millis(250);

/// toe - bridges a cloud IoT endpoint, a local MQTT bus and the local
/// Kubernetes API.
#[derive(Parser, Debug, Clone)]
#[command(name = "toe")]
#[command(author, version, about, long_about = None)]
pub struct AgentConfig {
    /// Device id within the registry.
    #[arg(long, env = "TOE_DEVICE", default_value = "no-default-device-id")]
    pub device: String,

    /// Cloud MQTT bridge host.
    #[arg(long, env = "TOE_MQTT_HOST", default_value = "mqtt.googleapis.com")]
    pub mqtt_host: String,

    /// Cloud MQTT bridge port.
    #[arg(long, env = "TOE_MQTT_PORT", default_value_t = 8883)]
    pub mqtt_port: u16,

    /// Cloud project id.
    #[arg(long, env = "TOE_PROJECT", default_value = "no-default-project-id")]
    pub project: String,

    /// Device registry id.
    #[arg(long, env = "TOE_IOT_REGISTRY", default_value = "no-default-registry-id")]
    pub registry: String,

    /// Cloud region of the registry.
    #[arg(long, env = "TOE_REGION", default_value = "us-central1")]
    pub region: String,

    /// CA bundle for the cloud bridge, e.g. https://pki.google.com/roots.pem.
    #[arg(long, env = "TOE_CA_CERT", default_value = "no-default-ca-cert")]
    pub ca_certs: PathBuf,

    /// Path to the device private key.
    #[arg(long, env = "TOE_PRIVATE_KEY", default_value = "no-default-private-key")]
    pub private_key: PathBuf,

    /// Signing algorithm of the private key (rs256 or es256).
    #[arg(long, env = "TOE_KEY_ALGORITHM", default_value = "rs256")]
    pub key_algorithm: SigningAlgorithm,

    /// Kubeconfig path; in-cluster configuration when unset.
    #[arg(long, env = "KUBE_CONFIG")]
    pub kube_config: Option<PathBuf>,

    /// Namespace of the managed deployments.
    #[arg(long, env = "TOE_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Local MQTT broker host.
    #[arg(long, env = "HMQ_SERVICE_HOST", default_value = "hmq")]
    pub mqtt_broker_host: String,

    /// Local MQTT broker port.
    #[arg(long, env = "HMQ_SERVICE_PORT", default_value_t = 1883)]
    pub mqtt_broker_port: u16,

    /// Seconds between state publishes.
    #[arg(
        long,
        env = "HEARTBEAT_INTERVAL",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub heartbeat_interval: u64,

    /// Lifetime of each cloud credential in seconds.
    #[arg(
        long,
        env = "TOE_TOKEN_LIFETIME",
        default_value_t = 86_400,
        value_parser = clap::value_parser!(u64).range(60..)
    )]
    pub token_lifetime: u64,
}

impl AgentConfig {
    /// The device identity.
    #[must_use]
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.project, &self.region, &self.registry, &self.device)
    }

    /// Interval between state publishes.
    #[must_use]
    pub const fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Lifetime of each cloud credential.
    #[must_use]
    pub const fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime)
    }

    /// Read the CA bundle for the cloud bridge.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] if the file cannot be read.
    pub fn load_ca(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.ca_certs).map_err(|e| {
            AgentError::Config(format!(
                "cannot read CA bundle {}: {e}",
                self.ca_certs.display()
            ))
        })
    }

    /// Connection template for the cloud bridge, without a password.
    #[must_use]
    pub fn cloud_options(&self, ca: Vec<u8>) -> ConnectOptions {
        ConnectOptions {
            username: Some(CLOUD_USERNAME.to_string()),
            keep_alive: KEEP_ALIVE,
            ack_timeout: ACK_TIMEOUT,
            ca: Some(ca),
            ..ConnectOptions::new(self.identity().client_id(), &self.mqtt_host, self.mqtt_port)
        }
    }

    /// Connection options for the local bus.
    #[must_use]
    pub fn local_options(&self) -> ConnectOptions {
        ConnectOptions {
            keep_alive: KEEP_ALIVE,
            ack_timeout: ACK_TIMEOUT,
            clean_session: true,
            ..ConnectOptions::new(LOCAL_CLIENT_ID, &self.mqtt_broker_host, self.mqtt_broker_port)
        }
    }

    /// Credential minter reading the configured private key.
    #[must_use]
    pub fn minter(&self) -> KeyFileMinter {
        KeyFileMinter::new(
            self.identity(),
            &self.private_key,
            self.key_algorithm,
            self.token_lifetime(),
        )
    }

    /// Cluster client configuration.
    #[must_use]
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig::new(&self.namespace, self.kube_config.clone())
    }

    /// Runtime settings, given the loaded CA bundle.
    #[must_use]
    pub fn settings(&self, ca: Vec<u8>) -> AgentSettings {
        let cluster = self.cluster_config();
        AgentSettings {
            identity: self.identity(),
            namespace: cluster.namespace,
            cloud: self.cloud_options(ca),
            local: self.local_options(),
            heartbeat_interval: self.heartbeat(),
            rotation_interval: rotation_interval(self.token_lifetime()),
            rotation_retry: rotation_retry(),
            quiesce: DISCONNECT_QUIESCE,
            conflict_retry: cluster.conflict_retry,
        }
    }
}
