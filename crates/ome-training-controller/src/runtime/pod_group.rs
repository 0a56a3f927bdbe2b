//! Gang scheduling through a scheduler-plugins PodGroup

use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Resource, ResourceExt};

use ome_common::crd::{TrainingJob, TrainingRuntimeSpec};
use ome_common::Error;

use super::jobset::TRAINER_JOB;
use super::{same_map, RuntimeInfo};

/// PodGroup API group
pub const POD_GROUP_GROUP: &str = "scheduling.x-k8s.io";
/// PodGroup API version
pub const POD_GROUP_VERSION: &str = "v1alpha1";
/// PodGroup kind
pub const POD_GROUP_KIND: &str = "PodGroup";
/// Pod label joining a pod to its group
pub const POD_GROUP_LABEL: &str = "scheduling.x-k8s.io/pod-group";

/// API coordinates of PodGroups
pub fn pod_group_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: POD_GROUP_GROUP.to_string(),
        version: POD_GROUP_VERSION.to_string(),
        kind: POD_GROUP_KIND.to_string(),
    })
}

/// Label trainer pods with their group when the runtime gang-schedules
pub(crate) fn enforce_pod_group_policy(info: &mut RuntimeInfo, job: &TrainingJob) {
    if info.pod_group_policy.is_some() {
        info.pod_labels
            .insert(POD_GROUP_LABEL.to_string(), job.name_any());
    }
}

/// Pods that must be schedulable together: every replica of every
/// replicated job, with the trainer scaled to `num_nodes`
pub fn min_member(template: &serde_json::Value, num_nodes: i32) -> i64 {
    let Some(rjobs) = template["replicatedJobs"].as_array() else {
        return i64::from(num_nodes);
    };
    rjobs
        .iter()
        .map(|rjob| {
            let replicas = rjob["replicas"].as_i64().unwrap_or(1);
            let pods = if rjob["name"] == TRAINER_JOB {
                i64::from(num_nodes)
            } else {
                rjob["template"]["spec"]["parallelism"].as_i64().unwrap_or(1)
            };
            replicas * pods
        })
        .sum()
}

/// Build the PodGroup for this pass, `None` when no write is needed.
///
/// Once created the group only changes while the job is suspended.
pub fn build_pod_group(
    job: &TrainingJob,
    info: &RuntimeInfo,
    runtime: &TrainingRuntimeSpec,
    old: Option<&DynamicObject>,
) -> Result<Option<DynamicObject>, Error> {
    let Some(policy) = &info.pod_group_policy else {
        return Ok(None);
    };

    let mut spec = serde_json::Map::new();
    spec.insert(
        "minMember".to_string(),
        serde_json::json!(min_member(&runtime.template.spec, info.num_nodes)),
    );
    if let Some(timeout) = policy.schedule_timeout_seconds {
        spec.insert(
            "scheduleTimeoutSeconds".to_string(),
            serde_json::json!(timeout),
        );
    }

    let mut pod_group = DynamicObject::new(&job.name_any(), &pod_group_resource())
        .within(&job.namespace().unwrap_or_default());
    pod_group.data = serde_json::json!({ "spec": spec });
    let owner = job
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal("TrainingJob has no UID"))?;
    pod_group.metadata.owner_references = Some(vec![owner]);

    let needs_write = match old {
        None => true,
        Some(old) => {
            pod_group.metadata.resource_version = old.metadata.resource_version.clone();
            job.is_suspended()
                && (old.data.get("spec") != pod_group.data.get("spec")
                    || !same_map(&old.metadata.labels, &pod_group.metadata.labels)
                    || !same_map(&old.metadata.annotations, &pod_group.metadata.annotations))
        }
    };
    Ok(needs_write.then_some(pod_group))
}
