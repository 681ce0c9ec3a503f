//! Device state aggregation.
//!
//! The aggregator owns the single [`DeviceState`] of the agent. Location
//! updates arrive from the local bus, workload statuses from the cluster,
//! and the publish path reads consistent snapshots. Every access goes
//! through one lock that is never held across an await point.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use toe_cluster::ClusterApi;
use toe_core::{AppStatus, DeviceState, LocationMessage};
use tracing::debug;

use crate::Result;

/// Lock-guarded owner of the device state.
pub struct StateAggregator {
    state: Mutex<DeviceState>,
    cluster: Arc<dyn ClusterApi>,
}

impl StateAggregator {
    /// Create an aggregator starting from the default state.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
            cluster,
        }
    }

    /// Apply a location update.
    pub fn update_location(&self, update: &LocationMessage) {
        let mut state = self.state.lock();
        state.location = update.location;
        state.accuracy = update.accuracy;
        debug!(
            lat = update.location.lat,
            lng = update.location.lng,
            accuracy = update.accuracy,
            "Location updated"
        );
    }

    /// Query container statuses and replace the per-workload status map.
    ///
    /// The map is replaced wholesale, so workloads that no longer run drop
    /// out of the snapshot. On failure the previous map is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster query fails.
    pub async fn refresh_workload_statuses(&self) -> Result<DeviceState> {
        let reports = self.cluster.container_statuses().await?;
        let apps: BTreeMap<String, AppStatus> = reports
            .into_iter()
            .map(toe_cluster::ContainerReport::into_app_status)
            .collect();

        let mut state = self.state.lock();
        debug!(apps = apps.len(), "Workload statuses refreshed");
        state.apps = apps;
        Ok(state.clone())
    }

    /// A consistent copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> DeviceState {
        self.state.lock().clone()
    }
}
