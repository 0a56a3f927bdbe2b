//! Base model volume for training pods
//!
//! The model agent places base model weights at `spec.storage.path` on the
//! nodes selected by `spec.storage.nodeSelector`. Training pods reach them
//! through a statically bound hostPath PersistentVolume and a claim in the
//! job namespace. Both are server-side applied every pass.

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt};
use tracing::debug;

use ome_common::crd::{ClusterBaseModel, TrainingJob};
use ome_common::Error;

use crate::client::TrainingKubeClient;

/// Requested size of the base model volume; hostPath does not enforce it
pub const BASE_MODEL_VOLUME_CAPACITY: &str = "500Gi";

/// Label naming the training job a volume was provisioned for
pub const TRAINING_JOB_LABEL: &str = "ome.io/training-job";
/// Label naming the namespace of that training job
pub const TRAINING_JOB_NAMESPACE_LABEL: &str = "ome.io/training-job-namespace";

const ACCESS_MODE: &str = "ReadOnlyMany";

/// Name of the cluster-scoped PersistentVolume of a job
pub fn persistent_volume_name(job_name: &str, namespace: &str, model: &str) -> String {
    format!("{model}-{namespace}-{job_name}")
}

/// Name of the claim of a job, in the job namespace
pub fn persistent_volume_claim_name(job_name: &str, model: &str) -> String {
    format!("{model}-{job_name}")
}

fn node_affinity(base_model: &ClusterBaseModel) -> Option<serde_json::Value> {
    let selector = &base_model.spec.storage.as_ref()?.node_selector;
    if selector.is_empty() {
        return None;
    }
    let expressions: Vec<serde_json::Value> = selector
        .iter()
        .map(|(k, v)| serde_json::json!({ "key": k, "operator": "In", "values": [v] }))
        .collect();
    Some(serde_json::json!({
        "required": { "nodeSelectorTerms": [{ "matchExpressions": expressions }] }
    }))
}

/// PersistentVolume manifest exposing the base model directory
pub fn build_persistent_volume(
    job: &TrainingJob,
    base_model: &ClusterBaseModel,
) -> Result<serde_json::Value, Error> {
    let job_name = job.name_any();
    let namespace = job.namespace().unwrap_or_default();
    let model = base_model.name_any();
    let path = base_model
        .spec
        .storage
        .as_ref()
        .and_then(|s| s.path.as_deref())
        .ok_or_else(|| {
            Error::validation_for(model.clone(), "base model has no storage path")
                .with_remediation("set spec.storage.path on the ClusterBaseModel")
        })?;

    let labels = BTreeMap::from([
        (TRAINING_JOB_LABEL, job_name.clone()),
        (TRAINING_JOB_NAMESPACE_LABEL, namespace.clone()),
    ]);

    let mut pv = serde_json::json!({
        "apiVersion": "v1",
        "kind": "PersistentVolume",
        "metadata": {
            "name": persistent_volume_name(&job_name, &namespace, &model),
            "labels": labels,
        },
        "spec": {
            "capacity": { "storage": BASE_MODEL_VOLUME_CAPACITY },
            "accessModes": [ACCESS_MODE],
            "persistentVolumeReclaimPolicy": "Retain",
            "storageClassName": "",
            "hostPath": { "path": path, "type": "Directory" },
            "claimRef": {
                "namespace": &namespace,
                "name": persistent_volume_claim_name(&job_name, &model),
            },
        }
    });
    if let Some(affinity) = node_affinity(base_model) {
        pv["spec"]["nodeAffinity"] = affinity;
    }
    Ok(pv)
}

/// PersistentVolumeClaim manifest bound to the job's volume
pub fn build_persistent_volume_claim(
    job: &TrainingJob,
    base_model: &ClusterBaseModel,
) -> Result<serde_json::Value, Error> {
    let job_name = job.name_any();
    let namespace = job.namespace().unwrap_or_default();
    let model = base_model.name_any();
    let owner = job
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal("TrainingJob has no UID"))?;

    Ok(serde_json::json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": persistent_volume_claim_name(&job_name, &model),
            "namespace": &namespace,
            "labels": BTreeMap::from([(TRAINING_JOB_LABEL, job_name.clone())]),
            "ownerReferences": [owner],
        },
        "spec": {
            "accessModes": [ACCESS_MODE],
            "storageClassName": "",
            "volumeName": persistent_volume_name(&job_name, &namespace, &model),
            "resources": { "requests": { "storage": BASE_MODEL_VOLUME_CAPACITY } },
        }
    }))
}

/// Apply the volume, then the claim
pub async fn reconcile_base_model_volume(
    kube: &dyn TrainingKubeClient,
    job: &TrainingJob,
    base_model: &ClusterBaseModel,
) -> Result<(), Error> {
    let job_name = job.name_any();
    let namespace = job.namespace().unwrap_or_default();
    let model = base_model.name_any();

    let pv = build_persistent_volume(job, base_model)?;
    let pv_name = persistent_volume_name(&job_name, &namespace, &model);
    kube.apply_persistent_volume(&pv_name, &pv).await?;

    let pvc = build_persistent_volume_claim(job, base_model)?;
    let pvc_name = persistent_volume_claim_name(&job_name, &model);
    kube.apply_persistent_volume_claim(&namespace, &pvc_name, &pvc)
        .await?;

    debug!(pv = %pv_name, pvc = %pvc_name, "base model volume reconciled");
    Ok(())
}
