//! Manifest decoding for the config channel.
//!
//! A manifest is a JSON array of `apps/v1` Deployment objects. Each config
//! message carries the complete desired set; there is no incremental format.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::Deployment;

use crate::types::DesiredWorkload;
use crate::{ClusterError, Result};

const API_VERSION: &str = "apps/v1";
const KIND: &str = "Deployment";

/// Decode a manifest payload into the desired workload list.
///
/// Entries may omit `apiVersion` and `kind`. Every deployment is pinned to
/// `namespace`. Entries without `metadata.name` and manifests repeating a
/// name are rejected as a whole.
///
/// # Errors
///
/// Returns [`ClusterError::Manifest`] for malformed JSON and
/// [`ClusterError::InvalidManifest`] for structural violations.
pub fn decode_manifest(payload: &[u8], namespace: &str) -> Result<Vec<DesiredWorkload>> {
    let entries: Vec<serde_json::Value> = serde_json::from_slice(payload)?;

    let mut seen = BTreeSet::new();
    let mut desired = Vec::with_capacity(entries.len());

    for (index, mut entry) in entries.into_iter().enumerate() {
        if let Some(object) = entry.as_object_mut() {
            object
                .entry("apiVersion")
                .or_insert_with(|| API_VERSION.into());
            object.entry("kind").or_insert_with(|| KIND.into());
        }
        let deployment: Deployment = serde_json::from_value(entry)?;

        let workload = normalize(deployment, namespace).ok_or_else(|| {
            ClusterError::InvalidManifest(format!("entry {index} has no metadata.name"))
        })?;

        if !seen.insert(workload.name.clone()) {
            return Err(ClusterError::InvalidManifest(format!(
                "duplicate workload name: {}",
                workload.name
            )));
        }

        desired.push(workload);
    }

    Ok(desired)
}

fn normalize(mut deployment: Deployment, namespace: &str) -> Option<DesiredWorkload> {
    let name = deployment
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())?;

    deployment.metadata.namespace = Some(namespace.to_string());
    // Server-populated fields from an exported object must not be replayed.
    deployment.metadata.resource_version = None;
    deployment.metadata.uid = None;
    deployment.status = None;

    Some(DesiredWorkload {
        name,
        spec: deployment,
    })
}
