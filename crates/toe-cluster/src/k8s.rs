//! Kubernetes access for the reconciler and state refresh.
//!
//! This module provides the [`ClusterApi`] seam and the `K8sCluster`
//! implementation, which manages `apps/v1` Deployments and reads pod container
//! statuses in a single namespace.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::types::{ClusterConfig, ContainerReport, ObservedWorkload};
use crate::{ClusterError, Result};

/// Narrow interface to the cluster API used by the agent.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every deployment in the managed namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the list call fails.
    async fn list_workloads(&self) -> Result<Vec<ObservedWorkload>>;

    /// Create a new deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails, including when the name is taken.
    async fn create_workload(&self, deployment: &Deployment) -> Result<()>;

    /// Replace an existing deployment with the given object.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement fails; a concurrent modification
    /// yields an error for which [`ClusterError::is_conflict`] is true.
    async fn replace_workload(&self, name: &str, deployment: &Deployment) -> Result<()>;

    /// Delete a deployment with foreground cascading.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails.
    async fn delete_workload(&self, name: &str) -> Result<()>;

    /// Report the status of every container of every pod in the namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the pod list call fails.
    async fn container_statuses(&self) -> Result<Vec<ContainerReport>>;
}

/// Kubernetes-backed cluster access.
pub struct K8sCluster {
    client: Client,
    namespace: String,
}

impl K8sCluster {
    /// Connect using the kubeconfig in `config`, or in-cluster
    /// configuration when none is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or the client
    /// cannot be built.
    pub async fn connect(config: &ClusterConfig) -> Result<Self> {
        let kube_config = match config.kube_config.as_deref() {
            Some(path) => Self::out_of_cluster_config(path).await?,
            None => {
                info!("Using in-cluster config");
                Config::incluster()
                    .map_err(|e| ClusterError::Config(format!("in-cluster config: {e}")))?
            }
        };

        let client = Client::try_from(kube_config)?;
        Ok(Self::with_client(client, config.namespace.clone()))
    }

    async fn out_of_cluster_config(path: &Path) -> Result<Config> {
        info!(path = %path.display(), "Using out-of-cluster config");
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| ClusterError::Config(format!("{}: {e}", path.display())))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::Config(format!("{}: {e}", path.display())))
    }

    /// Create a cluster handle with a pre-configured client.
    #[must_use]
    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// The managed namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn deployments_api(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterApi for K8sCluster {
    async fn list_workloads(&self) -> Result<Vec<ObservedWorkload>> {
        let list = self.deployments_api().list(&ListParams::default()).await?;

        let observed: Vec<_> = list
            .items
            .into_iter()
            .filter_map(ObservedWorkload::from_deployment)
            .collect();

        for (i, workload) in observed.iter().enumerate() {
            debug!(index = i, workload = %workload.name, "Observed deployment");
        }

        Ok(observed)
    }

    async fn create_workload(&self, deployment: &Deployment) -> Result<()> {
        self.deployments_api()
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn replace_workload(&self, name: &str, deployment: &Deployment) -> Result<()> {
        let api = self.deployments_api();

        // Carry the live resourceVersion so the write is conditional on the
        // object not having changed since this read.
        let current = api
            .get_opt(name)
            .await?
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;

        let mut replacement = deployment.clone();
        replacement.metadata.resource_version = current.metadata.resource_version;

        api.replace(name, &PostParams::default(), &replacement)
            .await?;
        Ok(())
    }

    async fn delete_workload(&self, name: &str) -> Result<()> {
        self.deployments_api()
            .delete(name, &DeleteParams::foreground())
            .await?;
        Ok(())
    }

    async fn container_statuses(&self) -> Result<Vec<ContainerReport>> {
        let pods = self.pods_api().list(&ListParams::default()).await?;

        Ok(pods
            .items
            .iter()
            .filter_map(|pod| pod.status.as_ref())
            .filter_map(|status| status.container_statuses.as_ref())
            .flatten()
            .map(ContainerReport::from_k8s)
            .collect())
    }
}

/// An in-memory cluster for testing without a real Kubernetes API.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};

    /// A call recorded by [`MockCluster`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ClusterCall {
        /// `list_workloads`.
        List,
        /// `create_workload` for the named deployment.
        Create(String),
        /// `replace_workload` for the named deployment.
        Replace(String),
        /// `delete_workload` for the named deployment.
        Delete(String),
        /// `container_statuses`.
        Statuses,
    }

    /// A failure to inject into the next matching call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Fault {
        /// Fail with a generic API error.
        Error,
        /// Fail with an optimistic-concurrency conflict.
        Conflict,
    }

    /// A mock cluster that stores deployments in memory.
    #[derive(Default)]
    pub struct MockCluster {
        deployments: Mutex<BTreeMap<String, Deployment>>,
        containers: Mutex<Vec<ContainerReport>>,
        calls: Mutex<Vec<ClusterCall>>,
        fail_list: Mutex<bool>,
        faults: Mutex<HashMap<String, (Fault, Option<u32>)>>,
        versions: Mutex<u64>,
    }

    impl MockCluster {
        /// Create a new empty mock cluster.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed an existing deployment with the given name.
        pub fn insert(&self, name: &str, deployment: Deployment) {
            let mut deployment = deployment;
            deployment.metadata.name = Some(name.to_string());
            self.deployments.lock().insert(name.to_string(), deployment);
        }

        /// Seed an empty deployment with the given name.
        pub fn insert_named(&self, name: &str) {
            self.insert(name, Deployment::default());
        }

        /// Names of the deployments currently stored.
        #[must_use]
        pub fn names(&self) -> Vec<String> {
            self.deployments.lock().keys().cloned().collect()
        }

        /// The stored deployment with the given name.
        #[must_use]
        pub fn get(&self, name: &str) -> Option<Deployment> {
            self.deployments.lock().get(name).cloned()
        }

        /// Set the container reports returned by `container_statuses`.
        pub fn set_containers(&self, containers: Vec<ContainerReport>) {
            *self.containers.lock() = containers;
        }

        /// Make every list call fail until cleared.
        pub fn fail_list(&self, fail: bool) {
            *self.fail_list.lock() = fail;
        }

        /// Make writes to `name` fail with `fault`.
        ///
        /// `times` bounds how many calls fail; `None` fails them all.
        pub fn inject(&self, name: &str, fault: Fault, times: Option<u32>) {
            self.faults.lock().insert(name.to_string(), (fault, times));
        }

        /// All calls made so far, in order.
        #[must_use]
        pub fn calls(&self) -> Vec<ClusterCall> {
            self.calls.lock().clone()
        }

        /// Forget the recorded calls.
        pub fn clear_calls(&self) {
            self.calls.lock().clear();
        }

        /// Number of recorded calls matching `predicate`.
        pub fn count_calls(&self, predicate: impl Fn(&ClusterCall) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| predicate(c)).count()
        }

        fn record(&self, call: ClusterCall) {
            self.calls.lock().push(call);
        }

        fn take_fault(&self, name: &str) -> Option<ClusterError> {
            let mut faults = self.faults.lock();
            let (fault, remaining) = faults.get(name).copied()?;

            match remaining {
                Some(0) => {
                    faults.remove(name);
                    return None;
                }
                Some(n) => {
                    faults.insert(name.to_string(), (fault, Some(n - 1)));
                }
                None => {}
            }

            Some(match fault {
                Fault::Error => ClusterError::Config(format!("injected failure for {name}")),
                Fault::Conflict => ClusterError::Conflict(name.to_string()),
            })
        }

        fn next_version(&self) -> String {
            let mut version = self.versions.lock();
            *version += 1;
            version.to_string()
        }
    }

    #[async_trait]
    impl ClusterApi for MockCluster {
        async fn list_workloads(&self) -> Result<Vec<ObservedWorkload>> {
            self.record(ClusterCall::List);
            if *self.fail_list.lock() {
                return Err(ClusterError::Config("injected list failure".to_string()));
            }
            Ok(self
                .deployments
                .lock()
                .values()
                .cloned()
                .filter_map(ObservedWorkload::from_deployment)
                .collect())
        }

        async fn create_workload(&self, deployment: &Deployment) -> Result<()> {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            self.record(ClusterCall::Create(name.clone()));
            if let Some(e) = self.take_fault(&name) {
                return Err(e);
            }

            let mut deployments = self.deployments.lock();
            if deployments.contains_key(&name) {
                return Err(ClusterError::AlreadyExists(name));
            }
            let mut stored = deployment.clone();
            stored.metadata.resource_version = Some(self.next_version());
            deployments.insert(name, stored);
            Ok(())
        }

        async fn replace_workload(&self, name: &str, deployment: &Deployment) -> Result<()> {
            self.record(ClusterCall::Replace(name.to_string()));
            if let Some(e) = self.take_fault(name) {
                return Err(e);
            }

            let mut deployments = self.deployments.lock();
            if !deployments.contains_key(name) {
                return Err(ClusterError::NotFound(name.to_string()));
            }
            let mut stored = deployment.clone();
            stored.metadata.resource_version = Some(self.next_version());
            deployments.insert(name.to_string(), stored);
            Ok(())
        }

        async fn delete_workload(&self, name: &str) -> Result<()> {
            self.record(ClusterCall::Delete(name.to_string()));
            if let Some(e) = self.take_fault(name) {
                return Err(e);
            }

            self.deployments
                .lock()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| ClusterError::NotFound(name.to_string()))
        }

        async fn container_statuses(&self) -> Result<Vec<ContainerReport>> {
            self.record(ClusterCall::Statuses);
            if *self.fail_list.lock() {
                return Err(ClusterError::Config("injected list failure".to_string()));
            }
            Ok(self.containers.lock().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{ClusterCall, Fault, MockCluster};
    use super::*;

    fn named(name: &str) -> Deployment {
        let mut d = Deployment::default();
        d.metadata.name = Some(name.to_string());
        d
    }

    #[tokio::test]
    async fn mock_cluster_crud() {
        let cluster = MockCluster::new();

        cluster.create_workload(&named("a")).await.unwrap();
        assert_eq!(cluster.names(), ["a"]);

        let err = cluster.create_workload(&named("a")).await.unwrap_err();
        assert!(err.is_already_exists());

        cluster.replace_workload("a", &named("a")).await.unwrap();
        assert_eq!(
            cluster.get("a").unwrap().metadata.resource_version.as_deref(),
            Some("2")
        );

        cluster.delete_workload("a").await.unwrap();
        assert!(cluster.names().is_empty());
        assert!(cluster.delete_workload("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn mock_cluster_bounded_faults() {
        let cluster = MockCluster::new();
        cluster.insert_named("b");
        cluster.inject("b", Fault::Conflict, Some(2));

        assert!(cluster.replace_workload("b", &named("b")).await.unwrap_err().is_conflict());
        assert!(cluster.replace_workload("b", &named("b")).await.unwrap_err().is_conflict());
        cluster.replace_workload("b", &named("b")).await.unwrap();

        assert_eq!(
            cluster.count_calls(|c| matches!(c, ClusterCall::Replace(n) if n == "b")),
            3
        );
    }

    #[tokio::test]
    async fn mock_cluster_list_failure() {
        let cluster = MockCluster::new();
        cluster.fail_list(true);
        assert!(cluster.list_workloads().await.is_err());
        cluster.fail_list(false);
        assert!(cluster.list_workloads().await.unwrap().is_empty());
        assert_eq!(cluster.calls(), [ClusterCall::List, ClusterCall::List]);
    }

    mod api_server {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        /// One request as seen by the stub server.
        pub struct Request {
            pub line: String,
            pub body: String,
        }

        async fn read_request(stream: &mut TcpStream) -> Request {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let length = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .map_or(0, |(_, v)| v.trim().parse::<usize>().unwrap());
            while buf.len() < header_end + length {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before body");
                buf.extend_from_slice(&chunk[..n]);
            }

            Request {
                line: head.lines().next().unwrap_or_default().to_string(),
                body: String::from_utf8_lossy(&buf[header_end..header_end + length]).to_string(),
            }
        }

        /// Serve one canned `(status, json)` response per connection, in
        /// order, and return the requests received.
        pub async fn serve(
            responses: Vec<(u16, serde_json::Value)>,
        ) -> (String, tokio::task::JoinHandle<Vec<Request>>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let handle = tokio::spawn(async move {
                let mut requests = Vec::new();
                for (status, body) in responses {
                    let (mut stream, _) = listener.accept().await.unwrap();
                    requests.push(read_request(&mut stream).await);
                    let body = body.to_string();
                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    stream.write_all(response.as_bytes()).await.unwrap();
                    stream.shutdown().await.unwrap();
                }
                requests
            });
            (url, handle)
        }
    }

    #[tokio::test]
    async fn replace_conflict_from_api_server_is_retriable() {
        let live = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default", "resourceVersion": "7"}
        });
        let conflict = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "Operation cannot be fulfilled on deployments.apps \"web\": the object has been modified",
            "reason": "Conflict",
            "code": 409
        });
        let (url, server) = api_server::serve(vec![(200, live), (409, conflict)]).await;

        let config = Config::new(url.parse().unwrap());
        let cluster = K8sCluster::with_client(Client::try_from(config).unwrap(), "default");
        let err = cluster
            .replace_workload("web", &named("web"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let requests = server.await.unwrap();
        assert!(requests[0]
            .line
            .starts_with("GET /apis/apps/v1/namespaces/default/deployments/web"));
        assert!(requests[1]
            .line
            .starts_with("PUT /apis/apps/v1/namespaces/default/deployments/web"));
        let sent: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
        assert_eq!(sent["metadata"]["resourceVersion"], "7");
    }
}
