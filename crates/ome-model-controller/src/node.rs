//! Node and ConfigMap side channels
//!
//! When a node goes away its status ConfigMap is removed so stale entries
//! stop counting. Changes to status ConfigMaps are fanned out to the models
//! named by their keys.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, info};

use ome_common::crd::{BaseModel, ClusterBaseModel};
use ome_common::model_entry::ModelKey;
use ome_common::{Error, MODEL_STATUS_LABEL_KEY};

use crate::client::ModelKubeClient;

/// Whether a ConfigMap carries `ome.io/model-status=true`
pub fn is_model_status_config_map(cm: &ConfigMap) -> bool {
    cm.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MODEL_STATUS_LABEL_KEY))
        .is_some_and(|v| v == "true")
}

/// Delete the status ConfigMap of a removed node.
///
/// ConfigMaps without the model-status label are left alone. No model is
/// requeued here; the ConfigMap watch takes care of that.
pub async fn cleanup_node_config_map(
    kube: &dyn ModelKubeClient,
    namespace: &str,
    node_name: &str,
) -> Result<bool, Error> {
    let Some(cm) = kube.get_config_map(namespace, node_name).await? else {
        debug!(node = %node_name, "no status ConfigMap for deleted node");
        return Ok(false);
    };

    if !is_model_status_config_map(&cm) {
        debug!(node = %node_name, "ConfigMap named after node is not a model status map, keeping");
        return Ok(false);
    }

    info!(node = %node_name, namespace = %namespace, "deleting status ConfigMap of removed node");
    kube.delete_config_map(namespace, node_name).await?;
    Ok(true)
}

/// Models referenced by the keys of a status ConfigMap
pub fn referenced_models(cm: &ConfigMap) -> Vec<ModelKey> {
    if !is_model_status_config_map(cm) {
        return Vec::new();
    }
    cm.data
        .iter()
        .flat_map(|d| d.keys())
        .filter_map(|k| ModelKey::parse(k))
        .collect()
}

/// Watch mapper: BaseModels named in a status ConfigMap
pub fn base_models_for_config_map(cm: ConfigMap) -> Vec<ObjectRef<BaseModel>> {
    referenced_models(&cm)
        .into_iter()
        .filter_map(|key| {
            let ns = key.namespace()?;
            Some(ObjectRef::new(key.name()).within(ns))
        })
        .collect()
}

/// Watch mapper: ClusterBaseModels named in a status ConfigMap
pub fn cluster_base_models_for_config_map(cm: ConfigMap) -> Vec<ObjectRef<ClusterBaseModel>> {
    referenced_models(&cm)
        .into_iter()
        .filter(|key| key.namespace().is_none())
        .map(|key| ObjectRef::new(key.name()))
        .collect()
}
