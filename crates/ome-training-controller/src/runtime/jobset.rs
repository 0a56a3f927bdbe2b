//! JobSet workload
//!
//! The JobSet is built from the runtime template the first time and from the
//! live object afterwards, so fields the JobSet controller defaulted survive
//! an update. Every list edit is keyed by `name`, which makes a rebuild of
//! an unchanged job produce an identical object.

use std::collections::BTreeMap;

use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Resource, ResourceExt};

use ome_common::crd::{
    Condition, ConditionStatus, StorageSpec, TrainingJob, TrainingRuntimeSpec,
    TRAIN_JOB_COMPLETE, TRAIN_JOB_FAILED,
};
use ome_common::Error;

use super::{
    array_entry, env_var, item_name, merge_named, merge_string_map, object_entry, same_map,
    trainer_paths, trainer_volume_mounts, upsert_named, RuntimeInfo, BASELINE_MODEL_ENV,
    PATH_PREFIX_ENV,
};
use crate::fine_tuned_weight::short_job_name;

/// JobSet API group
pub const JOBSET_GROUP: &str = "jobset.x-k8s.io";
/// JobSet API version
pub const JOBSET_VERSION: &str = "v1alpha2";
/// JobSet kind
pub const JOBSET_KIND: &str = "JobSet";

/// Replicated job running the dataset and model initializers
pub const INITIALIZER_JOB: &str = "initializer";
/// Replicated job running the trainer
pub const TRAINER_JOB: &str = "trainer-node";
/// Trainer container in the trainer pods
pub const TRAINER_CONTAINER: &str = "trainer";
/// Init container downloading the dataset
pub const DATASET_INITIALIZER: &str = "dataset-initializer";
/// Init container preparing the model output
pub const MODEL_INITIALIZER: &str = "model-initializer";

/// Initializer env naming the object to fetch or write
pub const STORAGE_URI_ENV: &str = "STORAGE_URI";
/// Initializer env carrying storage credentials
pub const STORAGE_KEY_ENV: &str = "STORAGE_KEY";
/// Model initializer env naming the base model
pub const MODEL_NAME_ENV: &str = "MODEL_NAME";
/// Key inside the credentials Secret
pub const STORAGE_KEY_SECRET_KEY: &str = "key";

const JOBSET_COMPLETED: &str = "Completed";
const JOBSET_FAILED: &str = "Failed";

/// API coordinates of JobSets
pub fn jobset_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: JOBSET_GROUP.to_string(),
        version: JOBSET_VERSION.to_string(),
        kind: JOBSET_KIND.to_string(),
    })
}

/// Name of the JobSet of a job
pub fn jobset_name(job: &TrainingJob) -> String {
    short_job_name(&job.name_any()).to_string()
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

/// Step-wise JobSet construction
pub struct JobSetBuilder {
    jobset: DynamicObject,
}

impl JobSetBuilder {
    /// Start from the runtime template
    pub fn new(job: &TrainingJob, info: &RuntimeInfo, template: &serde_json::Value) -> Self {
        let mut jobset = DynamicObject::new(&jobset_name(job), &jobset_resource())
            .within(&job.namespace().unwrap_or_default());
        jobset.metadata.labels = non_empty(&info.labels);
        jobset.metadata.annotations = non_empty(&info.annotations);
        jobset.data = serde_json::json!({ "spec": template });
        Self { jobset }
    }

    /// Start from the live JobSet, keeping its resourceVersion
    pub fn from_existing(jobset: &DynamicObject) -> Self {
        Self {
            jobset: jobset.clone(),
        }
    }

    fn replicated_job<'a>(
        data: &'a mut serde_json::Value,
        name: &str,
    ) -> Result<Option<&'a mut serde_json::Value>, Error> {
        let spec = object_entry(data, "spec")?;
        Ok(array_entry(spec, "replicatedJobs")?
            .iter_mut()
            .find(|rjob| item_name(rjob) == Some(name)))
    }

    /// Node count, pod metadata, volumes and the trainer container
    pub fn trainer(mut self, info: &RuntimeInfo, job: &TrainingJob) -> Result<Self, Error> {
        let Some(rjob) = Self::replicated_job(&mut self.jobset.data, TRAINER_JOB)? else {
            return Ok(self);
        };

        let job_spec = object_entry(object_entry(rjob, "template")?, "spec")?;
        job_spec["parallelism"] = serde_json::json!(info.num_nodes);
        job_spec["completions"] = serde_json::json!(info.num_nodes);

        let pod = object_entry(job_spec, "template")?;
        let pod_meta = object_entry(pod, "metadata")?;
        merge_string_map(pod_meta, "annotations", &info.annotations)?;
        merge_string_map(pod_meta, "labels", &info.labels)?;
        merge_string_map(pod_meta, "labels", &info.pod_labels)?;

        let pod_spec = object_entry(pod, "spec")?;
        let volumes = array_entry(pod_spec, "volumes")?;
        for volume in &info.volumes {
            upsert_named(volumes, volume.clone());
        }

        for container in array_entry(pod_spec, "containers")?.iter_mut() {
            if item_name(container) == Some(TRAINER_CONTAINER) {
                configure_trainer(container, info, job)?;
            }
        }
        Ok(self)
    }

    /// Dataset and model initializer env
    pub fn initializer(mut self, job: &TrainingJob) -> Result<Self, Error> {
        let Some(rjob) = Self::replicated_job(&mut self.jobset.data, INITIALIZER_JOB)? else {
            return Ok(self);
        };

        let pod_spec = object_entry(
            object_entry(object_entry(object_entry(rjob, "template")?, "spec")?, "template")?,
            "spec",
        )?;
        for container in array_entry(pod_spec, "initContainers")?.iter_mut() {
            match item_name(container) {
                Some(DATASET_INITIALIZER) => {
                    if let Some(datasets) = &job.spec.datasets {
                        configure_initializer(container, datasets, Vec::new());
                    }
                }
                Some(MODEL_INITIALIZER) => {
                    if let Some(model_config) = &job.spec.model_config {
                        let output = model_config.output_model.clone().unwrap_or_default();
                        let extra = model_config
                            .input_model
                            .iter()
                            .map(|m| env_var(MODEL_NAME_ENV, m))
                            .collect();
                        configure_initializer(container, &output, extra);
                    }
                }
                _ => {}
            }
        }
        Ok(self)
    }

    /// Mirror the job's suspend flag
    pub fn suspend(mut self, suspend: bool) -> Result<Self, Error> {
        object_entry(&mut self.jobset.data, "spec")?["suspend"] = serde_json::json!(suspend);
        Ok(self)
    }

    /// Make the job the controller owner
    pub fn owned_by(mut self, job: &TrainingJob) -> Result<Self, Error> {
        let owner = job
            .controller_owner_ref(&())
            .ok_or_else(|| Error::internal("TrainingJob has no UID"))?;
        let refs = self.jobset.metadata.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.uid != owner.uid);
        refs.push(owner);
        Ok(self)
    }

    /// The finished object
    pub fn build(self) -> DynamicObject {
        self.jobset
    }
}

fn configure_trainer(
    container: &mut serde_json::Value,
    info: &RuntimeInfo,
    job: &TrainingJob,
) -> Result<(), Error> {
    if let Some(trainer) = &job.spec.trainer {
        if let Some(image) = &trainer.image {
            container["image"] = serde_json::json!(image);
        }
        if !trainer.command.is_empty() {
            container["command"] = serde_json::json!(trainer.command);
        }
        if !trainer.args.is_empty() {
            container["args"] = serde_json::json!(trainer.args);
        }
        if let Some(resources) = &trainer.resources_per_node {
            container["resources"] = serde_json::to_value(resources)?;
        }
    }

    if !info.trainer_env.is_empty() {
        let existing = container_env(container);
        container["env"] =
            serde_json::Value::Array(merge_named(info.trainer_env.clone(), &existing));
    }

    let (path_prefix, baseline_model) = trainer_paths(info, job);
    let env = array_entry(container, "env")?;
    upsert_named(env, env_var(PATH_PREFIX_ENV, &path_prefix));
    upsert_named(env, env_var(BASELINE_MODEL_ENV, &baseline_model));

    let mounts = array_entry(container, "volumeMounts")?;
    for mount in trainer_volume_mounts(info, job) {
        upsert_named(mounts, mount);
    }
    Ok(())
}

fn container_env(container: &serde_json::Value) -> Vec<serde_json::Value> {
    container
        .get("env")
        .and_then(|e| e.as_array())
        .cloned()
        .unwrap_or_default()
}

/// `STORAGE_URI` first, then the template env, `extra`, the storage
/// parameters and the credentials reference
fn configure_initializer(
    container: &mut serde_json::Value,
    storage: &StorageSpec,
    extra: Vec<serde_json::Value>,
) {
    let uri = storage
        .storage_uri
        .iter()
        .map(|u| env_var(STORAGE_URI_ENV, u))
        .collect();
    let mut env = merge_named(uri, &container_env(container));
    for var in extra {
        upsert_named(&mut env, var);
    }
    for (name, value) in &storage.parameters {
        upsert_named(&mut env, env_var(name, value));
    }
    if let Some(secret) = &storage.storage_key {
        upsert_named(
            &mut env,
            serde_json::json!({
                "name": STORAGE_KEY_ENV,
                "valueFrom": { "secretKeyRef": { "name": secret, "key": STORAGE_KEY_SECRET_KEY } },
            }),
        );
    }
    container["env"] = serde_json::Value::Array(env);
}

/// Build the JobSet for this pass, `None` when the live one needs no write
pub fn build_jobset(
    job: &TrainingJob,
    info: &RuntimeInfo,
    runtime: &TrainingRuntimeSpec,
    old: Option<&DynamicObject>,
) -> Result<Option<DynamicObject>, Error> {
    let builder = match old {
        Some(existing) => JobSetBuilder::from_existing(existing),
        None => JobSetBuilder::new(job, info, &runtime.template.spec),
    };
    let jobset = builder
        .trainer(info, job)?
        .initializer(job)?
        .suspend(job.is_suspended())?
        .owned_by(job)?
        .build();

    Ok(needs_create_or_update(old, &jobset, job.is_suspended()).then_some(jobset))
}

fn is_suspended(jobset: &DynamicObject) -> bool {
    jobset.data["spec"]["suspend"].as_bool().unwrap_or(false)
}

/// Whether `new` has to be written.
///
/// A running JobSet is left alone except to resume it; a suspended one
/// picks up any spec or metadata change.
pub fn needs_create_or_update(
    old: Option<&DynamicObject>,
    new: &DynamicObject,
    job_suspended: bool,
) -> bool {
    let Some(old) = old else {
        return true;
    };
    if job_suspended {
        old.data.get("spec") != new.data.get("spec")
            || !same_map(&old.metadata.labels, &new.metadata.labels)
            || !same_map(&old.metadata.annotations, &new.metadata.annotations)
    } else {
        is_suspended(old) && !is_suspended(new)
    }
}

/// `Complete` or `Failed` from the JobSet status conditions
pub fn terminal_condition(jobset: &DynamicObject) -> Option<Condition> {
    let conditions = jobset.data["status"]["conditions"].as_array()?;
    let holds = |type_: &str| {
        conditions
            .iter()
            .find(|c| c["type"] == type_ && c["status"] == "True")
    };

    let (type_, observed, default_reason) = if let Some(c) = holds(JOBSET_COMPLETED) {
        (TRAIN_JOB_COMPLETE, c, "JobSetCompleted")
    } else if let Some(c) = holds(JOBSET_FAILED) {
        (TRAIN_JOB_FAILED, c, "JobSetFailed")
    } else {
        return None;
    };

    Some(Condition::new(
        type_,
        ConditionStatus::True,
        observed["reason"].as_str().unwrap_or(default_reason),
        observed["message"].as_str().unwrap_or_default(),
    ))
}
