//! The toe device agent.
//!
//! The agent holds two MQTT connections and a Kubernetes client:
//!
//! - A credentialed session to the cloud bridge that receives desired
//!   workload manifests and commands and publishes device state and events
//! - A session to the on-device bus that carries local events, location
//!   updates and forwarded sub-commands
//! - The cluster client that reconciles deployments and reports statuses
//!
//! # Architecture
//!
//! ```text
//!              cloud bridge                        local bus
//!                   │                                  │
//!            ┌──────┴───────┐                    ┌─────┴────┐
//!            │ CloudSession │◄─── rotation       │ LocalBus │
//!            └──────┬───────┘                    └─────┬────┘
//!                   │ config / commands / state        │ events / location
//!                   ▼                                  ▼
//!            ┌─────────────────────────────────────────────┐
//!            │                Demultiplexer                │
//!            └──────┬──────────────────┬──────────────┬────┘
//!                   ▼                  ▼              ▼
//!              Reconciler        StateAggregator   forward
//!                   │                  ▲
//!                   ▼                  │ heartbeat
//!               Kubernetes ────────────┘
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockConnector`], an in-memory
//! connector that records connects, publishes, subscriptions and
//! disconnects and can fail or hold the next connect.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod bus;
pub mod config;
pub mod demux;
pub mod error;
pub mod mqtt;
pub mod session;
pub mod state;
pub mod transport;

pub use agent::{Agent, AgentSettings, Collaborators, Exit};
pub use bus::LocalBus;
pub use config::AgentConfig;
pub use demux::{Demultiplexer, Disposition, LoopExit, Route, RouteTable};
pub use error::{AgentError, Result};
pub use mqtt::MqttConnector;
pub use session::{rotation_interval, rotation_retry, CloudSession};
pub use state::StateAggregator;
pub use transport::{
    ConnectOptions, Connector, InboundMessage, InboundReceiver, InboundSender, QoS, Transport,
};

#[cfg(any(test, feature = "test-utils"))]
pub use transport::mock::{MockConnector, Published};
