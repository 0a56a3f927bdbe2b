//! Training runtimes
//!
//! A runtime turns a TrainingJob plus its TrainingRuntime template into the
//! concrete workload objects (a JobSet and, with gang scheduling, a
//! PodGroup) and reports when that workload reached a terminal state.
//!
//! Backends are looked up by the group-kind of the job's `runtimeRef`
//! (`ClusterTrainingRuntime.ome.io`, `TrainingRuntime.ome.io`).

pub mod jobset;
pub mod pod_group;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use ome_common::crd::{
    ClusterBaseModel, Condition, PodGroupPolicy, RuntimeRef, TrainingJob, TrainingRuntimeSpec,
    TrainingRuntimeType, CLUSTER_TRAINING_RUNTIME_KIND, TRAINING_RUNTIME_KIND,
    TRAINING_RUNTIME_TYPE_ANNOTATION,
};
use ome_common::{Error, OME_API_GROUP};

use crate::annotations::COHERE_VENDOR;
use crate::client::TrainingKubeClient;
use crate::fine_tuned_weight::fine_tuned_weight_name;
use crate::storage::persistent_volume_claim_name;

pub use jobset::JobSetBuilder;

// =============================================================================
// Pod layout
// =============================================================================

/// Scratch volume holding the downloaded dataset
pub const DATA_EMPTY_DIR_VOLUME: &str = "data-empty-dir";
/// In-memory scratch volume the Cohere model initializer unpacks into
pub const MODEL_EMPTY_DIR_VOLUME: &str = "model-empty-dir";
/// Volume backed by the base model claim
pub const MODEL_STORE_VOLUME: &str = "model-store-pvc";
/// Where PEFT trainers see the base model
pub const MODEL_STORE_MOUNT_PATH: &str = "/mnt/models";
/// Where PEFT trainers see the dataset
pub const TRAINING_DATA_MOUNT_PATH: &str = "/mnt/data";
/// Root of the Cohere trainer working tree
pub const COHERE_STORE_PATH_PREFIX: &str = "/opt/ml/model";

/// Host files describing the node location, read by the training sidecar
pub const HOST_FILE_VOLUMES: [(&str, &str); 3] = [
    ("region-file", "/etc/region"),
    ("ad-file", "/etc/availability-domain"),
    ("realm-file", "/etc/realm"),
];

/// Env var telling the trainer where its working tree starts
pub const PATH_PREFIX_ENV: &str = "PATH_PREFIX";
/// Env var telling the trainer where the base model is
pub const BASELINE_MODEL_ENV: &str = "BASELINE_MODEL";
/// torchrun node count
pub const PET_NNODES_ENV: &str = "PET_NNODES";
/// torchrun processes per node
pub const PET_NPROC_PER_NODE_ENV: &str = "PET_NPROC_PER_NODE";

const DEFAULT_NPROC_PER_NODE: &str = "auto";

/// Runtime output of one build pass, ready to be created or replaced
#[derive(Clone, Debug)]
pub struct RuntimeObject {
    /// API coordinates of the object
    pub resource: ApiResource,
    /// The object; no resourceVersion means it does not exist yet
    pub object: DynamicObject,
}

impl RuntimeObject {
    /// `Kind/name` for logs
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.resource.kind, self.object.name_any())
    }

    /// Whether the object was read from the cluster
    pub fn exists(&self) -> bool {
        self.object.metadata.resource_version.is_some()
    }
}

/// Everything the object builders need, resolved once per pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeInfo {
    /// Labels for the workload, template labels overridden by the job's
    pub labels: BTreeMap<String, String>,
    /// Annotations for the workload, template annotations overridden by the job's
    pub annotations: BTreeMap<String, String>,
    /// Extra labels for the trainer pods
    pub pod_labels: BTreeMap<String, String>,
    /// Training server flavor
    pub runtime_type: Option<TrainingRuntimeType>,
    /// Trainer node count
    pub num_nodes: i32,
    /// Trainer env, taking precedence over the template's
    pub trainer_env: Vec<serde_json::Value>,
    /// Volumes added to the trainer pods
    pub volumes: Vec<serde_json::Value>,
    /// Gang scheduling policy
    pub pod_group_policy: Option<PodGroupPolicy>,
}

impl RuntimeInfo {
    /// Resolve the info for `job` on `runtime`
    pub fn new(
        job: &TrainingJob,
        runtime: &TrainingRuntimeSpec,
        base_model: &ClusterBaseModel,
    ) -> Result<Self, Error> {
        let template_meta = runtime.template.metadata.clone().unwrap_or_default();

        let mut labels = template_meta.labels;
        labels.extend(job.spec.labels.clone());
        let mut annotations = template_meta.annotations;
        annotations.extend(job.spec.annotations.clone());

        let runtime_type = annotations
            .get(TRAINING_RUNTIME_TYPE_ANNOTATION)
            .and_then(|t| t.parse().ok())
            .or_else(|| runtime.runtime_type());

        let trainer = job.spec.trainer.as_ref();
        let num_nodes = trainer
            .and_then(|t| t.num_nodes)
            .unwrap_or_else(|| runtime.num_nodes());

        let mut trainer_env = Vec::new();
        for env in trainer.map(|t| t.env.as_slice()).unwrap_or_default() {
            trainer_env.push(serde_json::to_value(env)?);
        }
        if let Some(torch) = runtime.ml_policy.as_ref().and_then(|p| p.torch.as_ref()) {
            let nproc = trainer
                .and_then(|t| t.num_proc_per_node.clone())
                .or_else(|| torch.num_proc_per_node.clone())
                .unwrap_or_else(|| DEFAULT_NPROC_PER_NODE.to_string());
            upsert_named(&mut trainer_env, env_var(PET_NNODES_ENV, &num_nodes.to_string()));
            upsert_named(&mut trainer_env, env_var(PET_NPROC_PER_NODE_ENV, &nproc));
        }

        let mut info = Self {
            labels,
            annotations,
            pod_labels: BTreeMap::new(),
            runtime_type,
            num_nodes,
            trainer_env,
            volumes: pod_volumes(job, base_model)?,
            pod_group_policy: runtime.pod_group_policy.clone(),
        };
        pod_group::enforce_pod_group_policy(&mut info, job);
        Ok(info)
    }

    /// Whether the trainer is the PEFT server
    pub fn is_peft(&self) -> bool {
        self.runtime_type == Some(TrainingRuntimeType::Peft)
    }
}

/// Volumes every trainer pod gets
fn pod_volumes(
    job: &TrainingJob,
    base_model: &ClusterBaseModel,
) -> Result<Vec<serde_json::Value>, Error> {
    let input_model = job.input_model().ok_or_else(|| {
        Error::validation_for(job.name_any(), "modelConfig.inputModel is required")
            .with_remediation("name the ClusterBaseModel to fine-tune in spec.modelConfig.inputModel")
    })?;
    let claim_name = persistent_volume_claim_name(&job.name_any(), input_model);

    let mut volumes = vec![serde_json::json!({ "name": DATA_EMPTY_DIR_VOLUME, "emptyDir": {} })];

    if base_model.spec.vendor.as_deref() == Some(COHERE_VENDOR) {
        volumes.push(serde_json::json!({
            "name": MODEL_EMPTY_DIR_VOLUME,
            "emptyDir": { "medium": "Memory" },
        }));
        volumes.push(serde_json::json!({
            "name": input_model,
            "persistentVolumeClaim": { "claimName": claim_name },
        }));
    } else {
        volumes.push(serde_json::json!({
            "name": MODEL_STORE_VOLUME,
            "persistentVolumeClaim": { "claimName": claim_name },
        }));
    }

    for (name, path) in HOST_FILE_VOLUMES {
        volumes.push(serde_json::json!({ "name": name, "hostPath": { "path": path } }));
    }
    Ok(volumes)
}

/// `PATH_PREFIX` and `BASELINE_MODEL` for the trainer container
pub fn trainer_paths(info: &RuntimeInfo, job: &TrainingJob) -> (String, String) {
    if info.is_peft() {
        return (
            TRAINING_DATA_MOUNT_PATH.to_string(),
            MODEL_STORE_MOUNT_PATH.to_string(),
        );
    }
    let job_name = job.name_any();
    let root = format!("{COHERE_STORE_PATH_PREFIX}/{}", fine_tuned_weight_name(&job_name));
    let baseline = match info.runtime_type {
        Some(TrainingRuntimeType::Cohere) => format!("{root}/ckpt-0"),
        _ => root.clone(),
    };
    (root, baseline)
}

/// Volume mounts added to the trainer container
pub fn trainer_volume_mounts(info: &RuntimeInfo, job: &TrainingJob) -> Vec<serde_json::Value> {
    if info.is_peft() {
        return vec![
            serde_json::json!({ "name": MODEL_STORE_VOLUME, "mountPath": MODEL_STORE_MOUNT_PATH }),
            serde_json::json!({ "name": DATA_EMPTY_DIR_VOLUME, "mountPath": TRAINING_DATA_MOUNT_PATH }),
        ];
    }
    let (root, _) = trainer_paths(info, job);
    vec![
        serde_json::json!({ "name": MODEL_EMPTY_DIR_VOLUME, "mountPath": root }),
        serde_json::json!({
            "name": DATA_EMPTY_DIR_VOLUME,
            "mountPath": format!("{root}/input/data/training/"),
        }),
    ]
}

// =============================================================================
// JSON helpers
// =============================================================================

/// `{"name": .., "value": ..}`
pub(crate) fn env_var(name: &str, value: &str) -> serde_json::Value {
    serde_json::json!({ "name": name, "value": value })
}

pub(crate) fn item_name(item: &serde_json::Value) -> Option<&str> {
    item.get("name").and_then(|n| n.as_str())
}

/// Replace the list entry with the same `name`, or append
pub(crate) fn upsert_named(list: &mut Vec<serde_json::Value>, item: serde_json::Value) {
    let name = item_name(&item).map(str::to_string);
    match list
        .iter_mut()
        .find(|existing| name.is_some() && item_name(existing) == name.as_deref())
    {
        Some(existing) => *existing = item,
        None => list.push(item),
    }
}

/// `first`, then the entries of `rest` whose names `first` does not use
pub(crate) fn merge_named(
    first: Vec<serde_json::Value>,
    rest: &[serde_json::Value],
) -> Vec<serde_json::Value> {
    let mut merged = first;
    for item in rest {
        let taken = item_name(item).is_some_and(|n| merged.iter().any(|m| item_name(m) == Some(n)));
        if !taken {
            merged.push(item.clone());
        }
    }
    merged
}

/// Mutable child object at `key`, created when absent.
///
/// Fails instead of panicking when the template holds a non-object there.
pub(crate) fn object_entry<'a>(
    value: &'a mut serde_json::Value,
    key: &str,
) -> Result<&'a mut serde_json::Value, Error> {
    if value.is_null() {
        *value = serde_json::Value::Object(serde_json::Map::new());
    }
    let map = value.as_object_mut().ok_or_else(|| {
        Error::validation(format!("runtime template: expected an object holding {key}"))
    })?;
    let child = map.entry(key).or_insert(serde_json::Value::Null);
    if child.is_null() {
        *child = serde_json::Value::Object(serde_json::Map::new());
    }
    if !child.is_object() {
        return Err(Error::validation(format!(
            "runtime template: {key} must be an object"
        )));
    }
    Ok(child)
}

/// Mutable array at `key`, created when absent
pub(crate) fn array_entry<'a>(
    value: &'a mut serde_json::Value,
    key: &str,
) -> Result<&'a mut Vec<serde_json::Value>, Error> {
    if value.is_null() {
        *value = serde_json::Value::Object(serde_json::Map::new());
    }
    let map = value.as_object_mut().ok_or_else(|| {
        Error::validation(format!("runtime template: expected an object holding {key}"))
    })?;
    let child = map
        .entry(key)
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if child.is_null() {
        *child = serde_json::Value::Array(Vec::new());
    }
    child
        .as_array_mut()
        .ok_or_else(|| Error::validation(format!("runtime template: {key} must be a list")))
}

/// Insert every pair of `entries` into the string map at `key`
pub(crate) fn merge_string_map(
    value: &mut serde_json::Value,
    key: &str,
    entries: &BTreeMap<String, String>,
) -> Result<(), Error> {
    if entries.is_empty() {
        return Ok(());
    }
    let map = object_entry(value, key)?;
    if let Some(map) = map.as_object_mut() {
        for (k, v) in entries {
            map.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
    }
    Ok(())
}

/// Label or annotation maps are equal, treating absent as empty
pub(crate) fn same_map(
    a: &Option<BTreeMap<String, String>>,
    b: &Option<BTreeMap<String, String>>,
) -> bool {
    a.as_ref().filter(|m| !m.is_empty()) == b.as_ref().filter(|m| !m.is_empty())
}

// =============================================================================
// Backends
// =============================================================================

/// Per-runtime object builder and terminal-state probe
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrainingRuntimeBackend: Send + Sync {
    /// Objects to create or update for this pass; empty when nothing changed
    async fn new_objects(
        &self,
        job: &TrainingJob,
        runtime: &TrainingRuntimeSpec,
        base_model: &ClusterBaseModel,
    ) -> Result<Vec<RuntimeObject>, Error>;

    /// `Complete` or `Failed` once the workload finished
    async fn terminal_condition(&self, job: &TrainingJob) -> Result<Option<Condition>, Error>;
}

/// JobSet plus optional PodGroup backend, shared by both runtime kinds
pub struct JobSetRuntime {
    kube: Arc<dyn TrainingKubeClient>,
}

impl JobSetRuntime {
    /// Create a backend reading existing objects through `kube`
    pub fn new(kube: Arc<dyn TrainingKubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl TrainingRuntimeBackend for JobSetRuntime {
    async fn new_objects(
        &self,
        job: &TrainingJob,
        runtime: &TrainingRuntimeSpec,
        base_model: &ClusterBaseModel,
    ) -> Result<Vec<RuntimeObject>, Error> {
        let info = RuntimeInfo::new(job, runtime, base_model)?;
        let namespace = job.namespace().unwrap_or_default();
        let mut objects = Vec::new();

        let pg_resource = pod_group::pod_group_resource();
        if info.pod_group_policy.is_some() {
            let old = self
                .kube
                .get_object(&pg_resource, &namespace, &job.name_any())
                .await?;
            if let Some(pg) = pod_group::build_pod_group(job, &info, runtime, old.as_ref())? {
                objects.push(RuntimeObject {
                    resource: pg_resource,
                    object: pg,
                });
            }
        }

        let js_resource = jobset::jobset_resource();
        let old = self
            .kube
            .get_object(&js_resource, &namespace, &jobset::jobset_name(job))
            .await?;
        if let Some(js) = jobset::build_jobset(job, &info, runtime, old.as_ref())? {
            objects.push(RuntimeObject {
                resource: js_resource,
                object: js,
            });
        }
        Ok(objects)
    }

    async fn terminal_condition(&self, job: &TrainingJob) -> Result<Option<Condition>, Error> {
        let namespace = job.namespace().unwrap_or_default();
        let jobset = self
            .kube
            .get_object(&jobset::jobset_resource(), &namespace, &jobset::jobset_name(job))
            .await?;
        Ok(jobset.as_ref().and_then(jobset::terminal_condition))
    }
}

/// Backends keyed by `Kind.group`
#[derive(Default)]
pub struct RuntimeRegistry {
    backends: HashMap<String, Arc<dyn TrainingRuntimeBackend>>,
}

impl RuntimeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry serving both runtime kinds with the JobSet backend
    pub fn with_jobset(kube: Arc<dyn TrainingKubeClient>) -> Self {
        let backend: Arc<dyn TrainingRuntimeBackend> = Arc::new(JobSetRuntime::new(kube));
        let mut registry = Self::new();
        registry.register(
            group_kind(CLUSTER_TRAINING_RUNTIME_KIND, OME_API_GROUP),
            backend.clone(),
        );
        registry.register(group_kind(TRAINING_RUNTIME_KIND, OME_API_GROUP), backend);
        registry
    }

    /// Add or replace the backend for `group_kind`
    pub fn register(&mut self, group_kind: String, backend: Arc<dyn TrainingRuntimeBackend>) {
        self.backends.insert(group_kind, backend);
    }

    /// Backend serving `runtime_ref`
    pub fn get(&self, runtime_ref: &RuntimeRef) -> Option<Arc<dyn TrainingRuntimeBackend>> {
        self.backends
            .get(&runtime_group_kind(runtime_ref))
            .cloned()
    }
}

/// `Kind.group`
pub fn group_kind(kind: &str, group: &str) -> String {
    format!("{kind}.{group}")
}

/// Group-kind a runtime reference resolves to
pub fn runtime_group_kind(runtime_ref: &RuntimeRef) -> String {
    group_kind(runtime_ref.kind(), runtime_ref.api_group())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{cluster_base_model, peft_params, runtime_spec, training_job};
    use ome_common::crd::{MlPolicy, TorchPolicy, TrainerSpec};

    #[test]
    fn test_info_merges_labels_with_job_precedence() {
        let info = RuntimeInfo::new(
            &training_job(peft_params()),
            &runtime_spec("peft"),
            &cluster_base_model("meta", None),
        )
        .unwrap();

        assert_eq!(info.labels["team"], "nlp");
        assert_eq!(info.labels["runtime"], "peft");
        assert_eq!(info.runtime_type, Some(TrainingRuntimeType::Peft));
        assert_eq!(info.num_nodes, 2);
        assert!(info.trainer_env.is_empty());
    }

    #[test]
    fn test_job_annotation_overrides_runtime_type() {
        let mut job = training_job(peft_params());
        job.spec.annotations.insert(
            TRAINING_RUNTIME_TYPE_ANNOTATION.to_string(),
            "cohere".to_string(),
        );
        let info =
            RuntimeInfo::new(&job, &runtime_spec("peft"), &cluster_base_model("meta", None))
                .unwrap();
        assert_eq!(info.runtime_type, Some(TrainingRuntimeType::Cohere));
    }

    #[test]
    fn test_torch_policy_sets_pet_env() {
        let mut job = training_job(peft_params());
        job.spec.trainer = Some(TrainerSpec {
            num_nodes: Some(4),
            num_proc_per_node: Some("8".to_string()),
            ..Default::default()
        });
        let mut runtime = runtime_spec("peft");
        runtime.ml_policy = Some(MlPolicy {
            num_nodes: Some(2),
            torch: Some(TorchPolicy::default()),
        });

        let info = RuntimeInfo::new(&job, &runtime, &cluster_base_model("meta", None)).unwrap();
        assert_eq!(info.num_nodes, 4);
        assert_eq!(info.trainer_env[0], env_var(PET_NNODES_ENV, "4"));
        assert_eq!(info.trainer_env[1], env_var(PET_NPROC_PER_NODE_ENV, "8"));
    }

    #[test]
    fn test_volumes_by_vendor() {
        let job = training_job(peft_params());
        let runtime = runtime_spec("peft");

        let meta = RuntimeInfo::new(&job, &runtime, &cluster_base_model("meta", None)).unwrap();
        let names: Vec<_> = meta.volumes.iter().filter_map(item_name).collect();
        assert_eq!(
            names,
            [DATA_EMPTY_DIR_VOLUME, MODEL_STORE_VOLUME, "region-file", "ad-file", "realm-file"]
        );
        assert_eq!(
            meta.volumes[1]["persistentVolumeClaim"]["claimName"],
            "llama-3-8b-trainingjob-ft-1"
        );

        let cohere =
            RuntimeInfo::new(&job, &runtime, &cluster_base_model("cohere", None)).unwrap();
        assert_eq!(cohere.volumes[1]["emptyDir"]["medium"], "Memory");
        assert_eq!(cohere.volumes[2]["name"], "llama-3-8b");
    }

    #[test]
    fn test_missing_input_model_is_validation_error() {
        let mut job = training_job(peft_params());
        job.spec.model_config = None;
        let err = RuntimeInfo::new(&job, &runtime_spec("peft"), &cluster_base_model("meta", None))
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_trainer_paths_per_runtime() {
        let job = training_job(peft_params());
        let mut info = RuntimeInfo {
            runtime_type: Some(TrainingRuntimeType::Peft),
            ..Default::default()
        };
        assert_eq!(
            trainer_paths(&info, &job),
            ("/mnt/data".to_string(), "/mnt/models".to_string())
        );

        info.runtime_type = Some(TrainingRuntimeType::Cohere);
        assert_eq!(
            trainer_paths(&info, &job),
            ("/opt/ml/model/ft-1".to_string(), "/opt/ml/model/ft-1/ckpt-0".to_string())
        );
        let mounts = trainer_volume_mounts(&info, &job);
        assert_eq!(mounts[1]["mountPath"], "/opt/ml/model/ft-1/input/data/training/");

        info.runtime_type = Some(TrainingRuntimeType::CohereCommandR);
        assert_eq!(trainer_paths(&info, &job).1, "/opt/ml/model/ft-1");
    }

    #[test]
    fn test_named_list_helpers() {
        let mut list = vec![env_var("A", "1"), env_var("B", "2")];
        upsert_named(&mut list, env_var("A", "3"));
        upsert_named(&mut list, env_var("C", "4"));
        assert_eq!(list, vec![env_var("A", "3"), env_var("B", "2"), env_var("C", "4")]);

        let merged = merge_named(vec![env_var("B", "new")], &list);
        assert_eq!(
            merged,
            vec![env_var("B", "new"), env_var("A", "3"), env_var("C", "4")]
        );
    }

    #[test]
    fn test_object_entry_rejects_non_objects() {
        let mut value = serde_json::json!({ "spec": "oops" });
        assert!(object_entry(&mut value, "spec").is_err());

        let mut empty = serde_json::Value::Null;
        object_entry(&mut empty, "spec").unwrap();
        assert!(empty["spec"].is_object());
    }

    #[test]
    fn test_registry_lookup_by_group_kind() {
        let kube: Arc<dyn TrainingKubeClient> =
            Arc::new(crate::client::MockTrainingKubeClient::new());
        let registry = RuntimeRegistry::with_jobset(kube);

        let cluster = RuntimeRef {
            name: "peft".to_string(),
            ..Default::default()
        };
        assert!(registry.get(&cluster).is_some());

        let unknown = RuntimeRef {
            name: "peft".to_string(),
            api_group: Some("kubeflow.org".to_string()),
            kind: Some("TrainingRuntime".to_string()),
        };
        assert_eq!(runtime_group_kind(&unknown), "TrainingRuntime.kubeflow.org");
        assert!(registry.get(&unknown).is_none());
    }
}
