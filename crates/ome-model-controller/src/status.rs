//! Per-node status aggregation
//!
//! Node agents publish one ConfigMap per node (named after the node) whose
//! keys identify models and whose values are encoded [`ModelEntry`] records.
//! The reconciler folds those records into the model status.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use tracing::{debug, warn};

use ome_common::crd::LifeCycleState;
use ome_common::model_entry::{ModelConfig, ModelEntry, ModelKey, ModelStatus};
use ome_common::Error;

use crate::client::ModelKubeClient;

/// Placement of one model across the nodes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeAggregate {
    /// Nodes reporting Ready, sorted
    pub nodes_ready: Vec<String>,
    /// Nodes reporting Failed, sorted
    pub nodes_failed: Vec<String>,
    /// Discovered configurations in node order
    pub configs: Vec<ModelConfig>,
}

impl NodeAggregate {
    /// Overall state derived from the node lists
    pub fn state(&self) -> LifeCycleState {
        lifecycle_state(&self.nodes_ready, &self.nodes_failed)
    }
}

/// Ready if any node is ready, Failed if none is ready but some failed,
/// otherwise still in transit
pub fn lifecycle_state(nodes_ready: &[String], nodes_failed: &[String]) -> LifeCycleState {
    if !nodes_ready.is_empty() {
        LifeCycleState::Ready
    } else if !nodes_failed.is_empty() {
        LifeCycleState::Failed
    } else {
        LifeCycleState::InTransit
    }
}

/// Fold `(node, raw entry)` pairs into an aggregate.
///
/// Undecodable entries are skipped. A node appears in at most one list.
pub fn aggregate_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> NodeAggregate {
    let mut out = NodeAggregate::default();

    for (node, raw) in entries {
        let entry = match ModelEntry::decode(raw) {
            Ok(e) => e,
            Err(e) => {
                debug!(node, error = %e, "skipping undecodable model entry");
                continue;
            }
        };

        if let Some(config) = entry.config {
            out.configs.push(config);
        }

        let node = node.to_string();
        match entry.status {
            ModelStatus::Ready => {
                out.nodes_failed.retain(|n| *n != node);
                if !out.nodes_ready.contains(&node) {
                    out.nodes_ready.push(node);
                }
            }
            ModelStatus::Failed => {
                if !out.nodes_ready.contains(&node) && !out.nodes_failed.contains(&node) {
                    out.nodes_failed.push(node);
                }
            }
            ModelStatus::Updating | ModelStatus::Deleted => {}
        }
    }

    out.nodes_ready.sort();
    out.nodes_failed.sort();
    out
}

/// Aggregate the model's entries across every live node.
///
/// ConfigMaps of nodes that no longer exist are ignored; a failed node
/// lookup skips that node for this round.
pub async fn collect_node_status(
    kube: &dyn ModelKubeClient,
    status_namespace: &str,
    key: &ModelKey,
) -> Result<NodeAggregate, Error> {
    let config_maps = kube.list_model_status_config_maps(status_namespace).await?;
    let data_key = key.config_map_key();

    let mut live: Vec<(String, String)> = Vec::new();
    for cm in &config_maps {
        let Some(raw) = cm.data.as_ref().and_then(|d| d.get(&data_key)) else {
            continue;
        };
        let node = cm.name_any();
        match kube.node_exists(&node).await {
            Ok(true) => live.push((node, raw.clone())),
            Ok(false) => debug!(node = %node, "ignoring status of deleted node"),
            Err(e) => warn!(node = %node, error = %e, "failed to look up node, skipping"),
        }
    }

    let aggregate = aggregate_entries(live.iter().map(|(n, r)| (n.as_str(), r.as_str())));
    debug!(
        config_maps = config_maps.len(),
        ready = aggregate.nodes_ready.len(),
        failed = aggregate.nodes_failed.len(),
        "aggregated model status"
    );
    Ok(aggregate)
}

/// Nodes still holding an entry for the model that is not `Deleted`.
///
/// An entry that cannot be decoded counts as not deleted.
pub fn nodes_pending_deletion(config_maps: &[ConfigMap], key: &ModelKey) -> Vec<String> {
    let data_key = key.config_map_key();
    let mut pending: Vec<String> = config_maps
        .iter()
        .filter_map(|cm| {
            let raw = cm.data.as_ref()?.get(&data_key)?;
            let deleted = matches!(
                ModelEntry::decode(raw),
                Ok(ModelEntry {
                    status: ModelStatus::Deleted,
                    ..
                })
            );
            (!deleted).then(|| cm.name_any())
        })
        .collect();
    pending.sort();
    pending
}
