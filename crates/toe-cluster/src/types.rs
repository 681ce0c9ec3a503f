//! Types for the cluster crate.

use std::fmt;
use std::path::PathBuf;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ContainerStatus;
use serde::{Deserialize, Serialize};
use toe_core::AppStatus;

use crate::retry::RetryConfig;

/// One entry of a desired-state manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredWorkload {
    /// Workload name, unique within a manifest.
    pub name: String,
    /// The deployment to converge to.
    pub spec: Deployment,
}

/// A workload as currently known by the cluster API.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedWorkload {
    /// Workload name.
    pub name: String,
    /// The live deployment object, including status.
    pub spec: Deployment,
}

impl ObservedWorkload {
    /// Wrap a live deployment; objects without a name are skipped.
    #[must_use]
    pub fn from_deployment(deployment: Deployment) -> Option<Self> {
        let name = deployment.metadata.name.clone()?;
        Some(Self {
            name,
            spec: deployment,
        })
    }
}

/// The write issued for one workload during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadAction {
    /// Submit as a new workload.
    Create,
    /// Replace the existing workload.
    Update,
    /// Remove the workload with foreground cascading.
    Delete,
}

impl fmt::Display for WorkloadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Result of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum ItemResult {
    /// The action completed.
    Applied,
    /// The action was skipped because the cluster already matched.
    AlreadyExists,
    /// The action failed; siblings were unaffected.
    Failed(String),
}

/// Per-item outcome of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Workload name.
    pub name: String,
    /// Action attempted.
    pub action: WorkloadAction,
    /// What happened.
    pub result: ItemResult,
}

impl ItemOutcome {
    /// Whether the item did not fail.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.result, ItemResult::Failed(_))
    }
}

/// Outcome of a whole reconciliation pass.
///
/// A pass succeeds at the pass level whenever the observation fetch
/// succeeded; individual items may still have failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Outcomes in execution order.
    pub outcomes: Vec<ItemOutcome>,
}

impl ReconcileReport {
    /// Outcomes that did not fail.
    pub fn succeeded(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    /// Outcomes that failed.
    pub fn failed(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Number of outcomes for the given action.
    #[must_use]
    pub fn count(&self, action: WorkloadAction) -> usize {
        self.outcomes.iter().filter(|o| o.action == action).count()
    }

    /// The outcome for a workload, if it was acted on.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&ItemOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

/// Status of one running container, as reported in device state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReport {
    /// Container name, matching the workload name for single-container
    /// deployments.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Restart count.
    pub restarts: i32,
    /// Condition summary, e.g. `running` or `waiting: CrashLoopBackOff`.
    pub condition: String,
}

impl ContainerReport {
    /// Summarize a Kubernetes container status.
    #[must_use]
    pub fn from_k8s(status: &ContainerStatus) -> Self {
        Self {
            name: status.name.clone(),
            image: status.image.clone(),
            restarts: status.restart_count,
            condition: Self::condition(status),
        }
    }

    fn condition(status: &ContainerStatus) -> String {
        let Some(state) = status.state.as_ref() else {
            return "unknown".to_string();
        };

        if state.running.is_some() {
            return "running".to_string();
        }
        if let Some(waiting) = &state.waiting {
            return match &waiting.reason {
                Some(reason) => format!("waiting: {reason}"),
                None => "waiting".to_string(),
            };
        }
        if let Some(terminated) = &state.terminated {
            return match &terminated.reason {
                Some(reason) => format!("terminated: {reason}"),
                None => format!("terminated: exit code {}", terminated.exit_code),
            };
        }
        "unknown".to_string()
    }

    /// Convert into the published per-app status.
    #[must_use]
    pub fn into_app_status(self) -> (String, AppStatus) {
        (
            self.name,
            AppStatus {
                version: self.image,
                status: self.condition,
                restarts: self.restarts,
            },
        )
    }
}

/// Configuration for the cluster client and reconciler.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Namespace holding the managed deployments.
    pub namespace: String,
    /// Kubeconfig path; `None` uses the in-cluster service account.
    pub kube_config: Option<PathBuf>,
    /// Retry policy for update conflicts.
    pub conflict_retry: RetryConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kube_config: None,
            conflict_retry: RetryConfig::conflict_default(),
        }
    }
}

impl ClusterConfig {
    /// Create a config for the given namespace and kubeconfig.
    ///
    /// An empty kubeconfig path means in-cluster configuration.
    #[must_use]
    pub fn new(namespace: impl Into<String>, kube_config: Option<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            kube_config: kube_config.filter(|p| !p.as_os_str().is_empty()),
            ..Default::default()
        }
    }
}
