//! Deployment reconciliation for the toe device agent.
//!
//! The cloud pushes the complete desired set of workloads as a manifest on
//! the config channel. This crate turns that manifest into Kubernetes writes
//! against the device's local cluster:
//!
//! - Manifest decoding and normalization ([`decode_manifest`])
//! - Set-based create/update/delete planning ([`ReconciliationPlan`])
//! - Best-effort execution with bounded conflict retry ([`Reconciler`])
//! - Container status reporting for the device state document
//!
//! # Architecture
//!
//! ```text
//!   config payload ──► decode_manifest ──► Vec<DesiredWorkload>
//!                                                 │
//!                      ClusterApi::list ──► ReconciliationPlan
//!                                                 │
//!                 ┌───────────────────────────────┼──────────────────┐
//!                 ▼                               ▼                  ▼
//!              create                 replace (retry on 409)       delete
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use toe_cluster::{decode_manifest, ClusterConfig, K8sCluster, Reconciler};
//!
//! # async fn example(payload: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClusterConfig::new("default", None);
//! let cluster = Arc::new(K8sCluster::connect(&config).await?);
//! let reconciler = Reconciler::new(cluster, config.conflict_retry.clone());
//!
//! let desired = decode_manifest(payload, &config.namespace)?;
//! let report = reconciler.reconcile(&desired).await?;
//! println!("{} items failed", report.failed().count());
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockCluster`], an in-memory cluster
//! that records calls and can inject conflicts and failures per workload.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod k8s;
pub mod manifest;
pub mod plan;
pub mod reconcile;
pub mod retry;
pub mod types;

pub use error::{ClusterError, Result};
pub use k8s::{ClusterApi, K8sCluster};
pub use manifest::decode_manifest;
pub use plan::ReconciliationPlan;
pub use reconcile::Reconciler;
pub use retry::{retry_when, RetryConfig};
pub use types::{
    ClusterConfig, ContainerReport, DesiredWorkload, ItemOutcome, ItemResult, ObservedWorkload,
    ReconcileReport, WorkloadAction,
};

#[cfg(any(test, feature = "test-utils"))]
pub use k8s::mock::{ClusterCall, Fault, MockCluster};
