//! Metadata-extraction Job
//!
//! Models stored on a private claim cannot be inspected by the node agents
//! until they are placed, so a one-shot Job mounts the claim read-only, reads
//! the model configuration and deposits what it finds in a
//! `<model>-metadata` ConfigMap.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use ome_common::model_entry::ModelConfig;
use ome_common::BASE_MODEL_TYPE_LABEL_KEY;

/// Agent image used when `OME_AGENT_IMAGE` is unset. Pinned, never a floating tag.
pub const DEFAULT_OME_AGENT_IMAGE: &str = "ghcr.io/sgl-project/ome/ome-agent:v1.2.3";

/// Service account the extraction pod runs as
pub const METADATA_SERVICE_ACCOUNT: &str = "basemodel-metadata-extractor";

/// Where the claim is mounted inside the pod
pub const MODEL_MOUNT_PATH: &str = "/mnt/models";

/// Label value identifying extraction Jobs
pub const METADATA_COMPONENT: &str = "metadata-extraction";

const COMPONENT_LABEL: &str = "ome.io/component";
const STORAGE_URI_ANNOTATION: &str = "ome.io/storage-uri";
const CONTAINER_NAME: &str = "metadata-extractor";
const VOLUME_NAME: &str = "model-storage";
const AGENT_BINARY: &str = "/usr/bin/ome-agent";

/// Seconds the Job may run before Kubernetes kills it
pub const ACTIVE_DEADLINE_SECONDS: i64 = 300;
/// Seconds a finished Job is kept before garbage collection
pub const TTL_SECONDS_AFTER_FINISHED: i32 = 300;
/// Pod retries before the Job is marked Failed
pub const BACKOFF_LIMIT: i32 = 3;

/// Name of the extraction Job for a model
pub fn metadata_job_name(model_name: &str) -> String {
    format!("{model_name}-metadata-extraction")
}

/// Name of the ConfigMap the Job writes its findings to
pub fn metadata_config_map_name(model_name: &str) -> String {
    format!("{model_name}-metadata")
}

/// Agent image, honoring the `OME_AGENT_IMAGE` override
pub fn ome_agent_image() -> String {
    std::env::var("OME_AGENT_IMAGE")
        .ok()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| DEFAULT_OME_AGENT_IMAGE.to_string())
}

/// Inputs for [`build_metadata_job`]
#[derive(Clone, Debug)]
pub struct MetadataJobParams {
    /// Model name
    pub model_name: String,
    /// Model namespace, `None` for cluster-scoped models
    pub model_namespace: Option<String>,
    /// Label pointing back at the model (`ome.io/basemodel` or `ome.io/clusterbasemodel`)
    pub owner_label: &'static str,
    /// Controller reference to the model
    pub owner: OwnerReference,
    /// Namespace of the Job; always the claim's namespace
    pub namespace: String,
    /// Claim to mount
    pub pvc_name: String,
    /// Path inside the claim holding the model
    pub sub_path: Option<String>,
    /// Original storage URI, recorded as an annotation
    pub storage_uri: String,
    /// Container image
    pub image: String,
}

/// Build the extraction Job.
///
/// The claim is mounted read-only at [`MODEL_MOUNT_PATH`] with the URI's
/// subpath, and the Job is owned by the model so it is collected with it.
pub fn build_metadata_job(params: &MetadataJobParams) -> Job {
    let mut pod_labels = BTreeMap::new();
    pod_labels.insert(COMPONENT_LABEL.to_string(), METADATA_COMPONENT.to_string());
    pod_labels.insert(params.owner_label.to_string(), params.model_name.clone());

    let mut labels = pod_labels.clone();
    labels.insert(BASE_MODEL_TYPE_LABEL_KEY.to_string(), "Serving".to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        STORAGE_URI_ANNOTATION.to_string(),
        params.storage_uri.clone(),
    );

    let args = vec![
        "model-metadata".to_string(),
        "--model-path".to_string(),
        MODEL_MOUNT_PATH.to_string(),
        "--basemodel-name".to_string(),
        params.model_name.clone(),
        "--basemodel-namespace".to_string(),
        params.model_namespace.clone().unwrap_or_default(),
    ];

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(params.image.clone()),
        command: Some(vec![AGENT_BINARY.to_string()]),
        args: Some(args),
        volume_mounts: Some(vec![VolumeMount {
            name: VOLUME_NAME.to_string(),
            mount_path: MODEL_MOUNT_PATH.to_string(),
            sub_path: params.sub_path.clone(),
            read_only: Some(true),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(resources("100m", "256Mi")),
            limits: Some(resources("500m", "512Mi")),
            ..Default::default()
        }),
        ..Default::default()
    };

    let volume = Volume {
        name: VOLUME_NAME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: params.pvc_name.clone(),
            read_only: Some(true),
        }),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(metadata_job_name(&params.model_name)),
            namespace: Some(params.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![params.owner.clone()]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(BACKOFF_LIMIT),
            active_deadline_seconds: Some(ACTIVE_DEADLINE_SECONDS),
            ttl_seconds_after_finished: Some(TTL_SECONDS_AFTER_FINISHED),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(METADATA_SERVICE_ACCOUNT.to_string()),
                    containers: vec![container],
                    volumes: Some(vec![volume]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resources(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut list = BTreeMap::new();
    list.insert("cpu".to_string(), Quantity(cpu.to_string()));
    list.insert("memory".to_string(), Quantity(memory.to_string()));
    list
}

// =============================================================================
// Job status
// =============================================================================

/// What one look at the Job and its output says
#[derive(Clone, Debug, PartialEq)]
pub enum JobObservation {
    /// No Job, no output: create it
    Missing,
    /// The Job is gone but left its output behind (TTL cleanup after success)
    Recovered(ModelConfig),
    /// Pods are running
    Running {
        /// Seconds since the Job started
        elapsed_secs: i64,
    },
    /// The Job succeeded and its output is usable
    Succeeded {
        /// Discovered metadata
        config: ModelConfig,
        /// Seconds from start to completion
        elapsed_secs: i64,
    },
    /// The Job failed, or succeeded without writing anything
    Failed {
        /// Why
        reason: String,
    },
    /// Created, no pod started yet
    Pending,
}

/// Classify the Job and its output ConfigMap
pub fn observe_job(
    job: Option<&Job>,
    output: Option<&ConfigMap>,
    now: DateTime<Utc>,
) -> JobObservation {
    let output = output.and_then(discovered_config);

    let Some(job) = job else {
        return match output {
            Some(config) => JobObservation::Recovered(config),
            None => JobObservation::Missing,
        };
    };

    let status = job.status.clone().unwrap_or_default();
    let elapsed_secs = job_elapsed_secs(job, now);

    if status.succeeded.unwrap_or(0) > 0 {
        return match output {
            Some(config) => JobObservation::Succeeded {
                config,
                elapsed_secs,
            },
            None => JobObservation::Failed {
                reason: "metadata ConfigMap is missing or empty after job success".to_string(),
            },
        };
    }
    if status.failed.unwrap_or(0) > 0 {
        return JobObservation::Failed {
            reason: job_failure_reason(job),
        };
    }
    if status.active.unwrap_or(0) > 0 {
        return JobObservation::Running { elapsed_secs };
    }
    JobObservation::Pending
}

/// Metadata from an output ConfigMap; `None` when it holds no data
pub fn discovered_config(cm: &ConfigMap) -> Option<ModelConfig> {
    let data = cm.data.as_ref().filter(|d| !d.is_empty())?;
    Some(ModelConfig::from_flat_map(data))
}

/// Reason from the Failed condition: its message, else its reason, else a count
pub fn job_failure_reason(job: &Job) -> String {
    let status = job.status.as_ref();
    let failed = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
        });

    if let Some(condition) = failed {
        if let Some(message) = condition.message.as_ref().filter(|m| !m.is_empty()) {
            return message.clone();
        }
        if let Some(reason) = condition.reason.as_ref().filter(|r| !r.is_empty()) {
            return reason.clone();
        }
    }

    format!(
        "Job failed after {} attempts",
        status.and_then(|s| s.failed).unwrap_or(0)
    )
}

fn job_elapsed_secs(job: &Job, now: DateTime<Utc>) -> i64 {
    let Some(status) = job.status.as_ref() else {
        return 0;
    };
    let Some(start) = status.start_time.as_ref() else {
        return 0;
    };
    let end = status.completion_time.as_ref().map(|t| t.0).unwrap_or(now);
    end.signed_duration_since(start.0).num_seconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn params() -> MetadataJobParams {
        MetadataJobParams {
            model_name: "llama".to_string(),
            model_namespace: Some("team-a".to_string()),
            owner_label: "ome.io/basemodel",
            owner: OwnerReference {
                api_version: "ome.io/v1beta1".to_string(),
                kind: "BaseModel".to_string(),
                name: "llama".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
            namespace: "team-a".to_string(),
            pvc_name: "models".to_string(),
            sub_path: Some("llama-3/8b".to_string()),
            storage_uri: "pvc://models/llama-3/8b".to_string(),
            image: DEFAULT_OME_AGENT_IMAGE.to_string(),
        }
    }

    fn job_with(status: JobStatus) -> Job {
        let mut job = build_metadata_job(&params());
        job.status = Some(status);
        job
    }

    fn output(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_shape() {
        let job = build_metadata_job(&params());
        assert_eq!(job.metadata.name.as_deref(), Some("llama-metadata-extraction"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["ome.io/component"], "metadata-extraction");
        assert_eq!(labels["ome.io/basemodel"], "llama");
        assert_eq!(labels["base-model-type"], "Serving");
        assert_eq!(
            job.metadata.annotations.as_ref().unwrap()["ome.io/storage-uri"],
            "pvc://models/llama-3/8b"
        );
        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.controller, Some(true));

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.active_deadline_seconds, Some(300));
        assert_eq!(spec.ttl_seconds_after_finished, Some(300));
        assert_eq!(spec.backoff_limit, Some(3));

        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.service_account_name.as_deref(),
            Some("basemodel-metadata-extractor")
        );

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some(DEFAULT_OME_AGENT_IMAGE));
        assert!(!container.image.as_ref().unwrap().ends_with(":latest"));
        let mount = &container.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/mnt/models");
        assert_eq!(mount.sub_path.as_deref(), Some("llama-3/8b"));
        assert_eq!(mount.read_only, Some(true));

        let resources = container.resources.as_ref().unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"].0, "100m");
        assert_eq!(resources.requests.as_ref().unwrap()["memory"].0, "256Mi");
        assert_eq!(resources.limits.as_ref().unwrap()["cpu"].0, "500m");
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "512Mi");

        let claim = pod.volumes.as_ref().unwrap()[0]
            .persistent_volume_claim
            .as_ref()
            .unwrap();
        assert_eq!(claim.claim_name, "models");
        assert_eq!(claim.read_only, Some(true));
    }

    #[test]
    fn test_cluster_model_passes_empty_namespace() {
        let mut p = params();
        p.model_namespace = None;
        p.owner_label = "ome.io/clusterbasemodel";
        let job = build_metadata_job(&p);
        let args = job.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();
        assert_eq!(args.last().map(String::as_str), Some(""));
    }

    /// Story: a TTL-cleaned successful Job is recognized from its output alone
    #[test]
    fn story_ttl_cleaned_job_recovers_from_config_map() {
        let cm = output(&[("modelType", "llama"), ("modelArchitecture", "LlamaForCausalLM")]);
        match observe_job(None, Some(&cm), Utc::now()) {
            JobObservation::Recovered(config) => {
                assert_eq!(config.model_type.as_deref(), Some("llama"))
            }
            other => panic!("expected recovery, got {other:?}"),
        }
        assert_eq!(observe_job(None, None, Utc::now()), JobObservation::Missing);
    }

    /// Story: success without output counts as a failed extraction
    #[test]
    fn story_empty_output_after_success_is_failure() {
        let job = job_with(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        let empty = output(&[]);
        assert!(matches!(
            observe_job(Some(&job), Some(&empty), Utc::now()),
            JobObservation::Failed { .. }
        ));

        let cm = output(&[("modelType", "llama")]);
        assert!(matches!(
            observe_job(Some(&job), Some(&cm), Utc::now()),
            JobObservation::Succeeded { .. }
        ));
    }

    #[test]
    fn test_running_and_pending() {
        let now = Utc::now();
        let running = job_with(JobStatus {
            active: Some(1),
            start_time: Some(Time(now - chrono::Duration::seconds(42))),
            ..Default::default()
        });
        assert_eq!(
            observe_job(Some(&running), None, now),
            JobObservation::Running { elapsed_secs: 42 }
        );

        let pending = job_with(JobStatus::default());
        assert_eq!(observe_job(Some(&pending), None, now), JobObservation::Pending);
    }

    #[test]
    fn test_failure_reason_precedence() {
        let condition = |reason: Option<&str>, message: Option<&str>| JobCondition {
            type_: "Failed".to_string(),
            status: "True".to_string(),
            reason: reason.map(str::to_string),
            message: message.map(str::to_string),
            ..Default::default()
        };

        let with_message = job_with(JobStatus {
            failed: Some(1),
            conditions: Some(vec![condition(
                Some("DeadlineExceeded"),
                Some("Job was active longer than specified deadline"),
            )]),
            ..Default::default()
        });
        assert_eq!(
            job_failure_reason(&with_message),
            "Job was active longer than specified deadline"
        );

        let reason_only = job_with(JobStatus {
            failed: Some(1),
            conditions: Some(vec![condition(Some("BackoffLimitExceeded"), None)]),
            ..Default::default()
        });
        assert_eq!(job_failure_reason(&reason_only), "BackoffLimitExceeded");

        let bare = job_with(JobStatus {
            failed: Some(4),
            ..Default::default()
        });
        assert_eq!(job_failure_reason(&bare), "Job failed after 4 attempts");
        assert!(matches!(
            observe_job(Some(&bare), None, Utc::now()),
            JobObservation::Failed { .. }
        ));
    }
}
