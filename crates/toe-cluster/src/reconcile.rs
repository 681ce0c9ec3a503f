//! Best-effort reconciliation of desired deployments against the cluster.
//!
//! A pass re-lists the namespace, plans creates/updates/deletes by name, and
//! executes every item independently. Only a failed observation fetch fails
//! the pass; per-item failures are logged and reported but never abort
//! sibling items, and there is no rollback.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::apps::v1::Deployment;
use tracing::{info, warn};

use crate::k8s::ClusterApi;
use crate::plan::ReconciliationPlan;
use crate::retry::{retry_when, RetryConfig};
use crate::types::{DesiredWorkload, ItemOutcome, ItemResult, ReconcileReport, WorkloadAction};
use crate::{ClusterError, Result};

/// Drives reconciliation passes against a [`ClusterApi`].
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    conflict_retry: RetryConfig,
}

impl Reconciler {
    /// Create a reconciler with the given conflict retry policy.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, conflict_retry: RetryConfig) -> Self {
        Self {
            cluster,
            conflict_retry,
        }
    }

    /// Run one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns an error only if the observed state cannot be listed, in which
    /// case no workload is touched.
    pub async fn reconcile(&self, desired: &[DesiredWorkload]) -> Result<ReconcileReport> {
        let observed = self.cluster.list_workloads().await.map_err(|e| {
            warn!(error = %e, "Failed to list deployments, skipping reconciliation");
            e
        })?;

        let plan = ReconciliationPlan::compute(desired, &observed);
        info!(
            desired = desired.len(),
            observed = observed.len(),
            create = plan.create.len(),
            update = plan.update.len(),
            delete = plan.delete.len(),
            "Planned reconciliation"
        );

        let specs: HashMap<&str, &Deployment> =
            desired.iter().map(|d| (d.name.as_str(), &d.spec)).collect();

        let creates = plan.create.iter().filter_map(|name| {
            specs
                .get(name.as_str())
                .map(|spec| self.create(name, spec))
        });
        let updates = plan.update.iter().filter_map(|name| {
            specs
                .get(name.as_str())
                .map(|spec| self.update(name, spec))
        });
        let deletes = plan.delete.iter().map(|name| self.delete(name));

        let mut outcomes = join_all(creates).await;
        outcomes.extend(join_all(updates).await);
        outcomes.extend(join_all(deletes).await);

        let report = ReconcileReport { outcomes };
        info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    async fn create(&self, name: &str, spec: &Deployment) -> ItemOutcome {
        info!(workload = %name, "Creating deployment");
        let result = match self.cluster.create_workload(spec).await {
            Ok(()) => {
                info!(workload = %name, "Created deployment");
                ItemResult::Applied
            }
            Err(e) if e.is_already_exists() => {
                warn!(workload = %name, error = %e, "Deployment already exists");
                ItemResult::AlreadyExists
            }
            Err(e) => Self::failed(name, WorkloadAction::Create, &e),
        };
        Self::outcome(name, WorkloadAction::Create, result)
    }

    async fn update(&self, name: &str, spec: &Deployment) -> ItemOutcome {
        info!(workload = %name, "Updating deployment");
        let operation = format!("update deployment {name}");
        let result = retry_when(
            &self.conflict_retry,
            &operation,
            ClusterError::is_conflict,
            || self.cluster.replace_workload(name, spec),
        )
        .await;

        let result = match result {
            Ok(()) => {
                info!(workload = %name, "Updated deployment");
                ItemResult::Applied
            }
            Err(e) => Self::failed(name, WorkloadAction::Update, &e),
        };
        Self::outcome(name, WorkloadAction::Update, result)
    }

    async fn delete(&self, name: &str) -> ItemOutcome {
        info!(workload = %name, "Deleting deployment");
        let result = match self.cluster.delete_workload(name).await {
            Ok(()) => {
                info!(workload = %name, "Deleted deployment");
                ItemResult::Applied
            }
            Err(e) => Self::failed(name, WorkloadAction::Delete, &e),
        };
        Self::outcome(name, WorkloadAction::Delete, result)
    }

    fn failed(name: &str, action: WorkloadAction, error: &ClusterError) -> ItemResult {
        warn!(workload = %name, %action, error = %error, "Reconciliation item failed");
        ItemResult::Failed(error.to_string())
    }

    fn outcome(name: &str, action: WorkloadAction, result: ItemResult) -> ItemOutcome {
        ItemOutcome {
            name: name.to_string(),
            action,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::mock::{ClusterCall, Fault, MockCluster};

    fn desired(names: &[&str]) -> Vec<DesiredWorkload> {
        names
            .iter()
            .map(|n| {
                let mut spec = Deployment::default();
                spec.metadata.name = Some((*n).to_string());
                DesiredWorkload {
                    name: (*n).to_string(),
                    spec,
                }
            })
            .collect()
    }

    fn reconciler(cluster: &Arc<MockCluster>) -> Reconciler {
        Reconciler::new(cluster.clone(), RetryConfig::immediate(3))
    }

    fn writes(cluster: &MockCluster) -> Vec<ClusterCall> {
        cluster
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, ClusterCall::List | ClusterCall::Statuses))
            .collect()
    }

    #[tokio::test]
    async fn mixed_plan_is_executed() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_named("b");
        cluster.insert_named("c");

        let report = reconciler(&cluster)
            .reconcile(&desired(&["a", "b"]))
            .await
            .unwrap();

        assert_eq!(report.outcome("a").unwrap().action, WorkloadAction::Create);
        assert_eq!(report.outcome("b").unwrap().action, WorkloadAction::Update);
        assert_eq!(report.outcome("c").unwrap().action, WorkloadAction::Delete);
        assert_eq!(report.failed().count(), 0);
        assert_eq!(cluster.names(), ["a", "b"]);
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let cluster = Arc::new(MockCluster::new());
        let reconciler = reconciler(&cluster);
        let manifest = desired(&["a", "b"]);

        reconciler.reconcile(&manifest).await.unwrap();
        cluster.clear_calls();

        let report = reconciler.reconcile(&manifest).await.unwrap();

        assert_eq!(report.count(WorkloadAction::Create), 0);
        assert_eq!(report.count(WorkloadAction::Delete), 0);
        assert_eq!(report.count(WorkloadAction::Update), 2);
        assert!(writes(&cluster)
            .iter()
            .all(|c| matches!(c, ClusterCall::Replace(_))));
        assert_eq!(cluster.names(), ["a", "b"]);
    }

    #[tokio::test]
    async fn list_failure_touches_nothing() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_named("c");
        cluster.fail_list(true);

        let result = reconciler(&cluster).reconcile(&desired(&["a"])).await;

        assert!(result.is_err());
        assert!(writes(&cluster).is_empty());
        assert_eq!(cluster.names(), ["c"]);
    }

    #[tokio::test]
    async fn persistent_conflict_is_isolated() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_named("b");
        cluster.insert_named("c");
        cluster.inject("b", Fault::Conflict, None);

        let report = reconciler(&cluster)
            .reconcile(&desired(&["a", "b"]))
            .await
            .unwrap();

        assert!(report.outcome("a").unwrap().is_success());
        assert!(report.outcome("c").unwrap().is_success());
        assert!(matches!(
            report.outcome("b").unwrap().result,
            ItemResult::Failed(_)
        ));
        assert_eq!(
            cluster.count_calls(|c| matches!(c, ClusterCall::Replace(n) if n == "b")),
            3
        );
        assert_eq!(cluster.names(), ["a", "b"]);
    }

    #[tokio::test]
    async fn transient_conflict_is_retried() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_named("b");
        cluster.inject("b", Fault::Conflict, Some(2));

        let report = reconciler(&cluster).reconcile(&desired(&["b"])).await.unwrap();

        assert_eq!(report.outcome("b").unwrap().result, ItemResult::Applied);
        assert_eq!(
            cluster.count_calls(|c| matches!(c, ClusterCall::Replace(_))),
            3
        );
    }

    #[tokio::test]
    async fn non_conflict_update_errors_are_not_retried() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_named("b");
        cluster.inject("b", Fault::Error, None);

        let report = reconciler(&cluster).reconcile(&desired(&["b"])).await.unwrap();

        assert!(!report.outcome("b").unwrap().is_success());
        assert_eq!(
            cluster.count_calls(|c| matches!(c, ClusterCall::Replace(_))),
            1
        );
    }

    #[tokio::test]
    async fn create_and_delete_failures_are_isolated() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert_named("old-1");
        cluster.insert_named("old-2");
        cluster.inject("new-1", Fault::Error, None);
        cluster.inject("old-1", Fault::Error, None);

        let report = reconciler(&cluster)
            .reconcile(&desired(&["new-1", "new-2"]))
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.failed().count(), 2);
        assert!(report.outcome("new-2").unwrap().is_success());
        assert!(report.outcome("old-2").unwrap().is_success());
        assert_eq!(cluster.names(), ["new-2", "old-1"]);
    }

    #[tokio::test]
    async fn create_race_is_a_warning() {
        let cluster = Arc::new(MockCluster::new());
        let spec = desired(&["a"]).remove(0).spec;

        // The workload appeared between the list and the create.
        cluster.insert_named("a");
        let outcome = reconciler(&cluster).create("a", &spec).await;

        assert_eq!(outcome.result, ItemResult::AlreadyExists);
        assert!(outcome.is_success());
    }
}
