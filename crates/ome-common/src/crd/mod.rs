//! Custom Resource Definitions for OME

mod base_model;
mod fine_tuned_weight;
mod training_job;
mod training_runtime;
mod types;

pub use base_model::{
    BaseModel, BaseModelSpec, BaseModelStatus, ClusterBaseModel, ClusterBaseModelSpec,
    ModelResource, StorageValidationStatus, BASE_MODEL_FINALIZER, CLUSTER_BASE_MODEL_FINALIZER,
};
pub use fine_tuned_weight::{FineTunedWeight, FineTunedWeightSpec, FineTunedWeightStatus};
pub use training_job::{
    HyperparameterTuningConfig, MetricConfig, ReplicatedJobStatus, RuntimeRef, TrainerSpec,
    TrainingJob, TrainingJobSpec, TrainingJobStatus, TrainingModelConfig,
    CLUSTER_TRAINING_RUNTIME_KIND, TRAINING_RUNTIME_KIND, TRAIN_JOB_COMPLETE, TRAIN_JOB_CREATED,
    TRAIN_JOB_FAILED, TRAIN_JOB_SUSPENDED,
};
pub use training_runtime::{
    ClusterTrainingRuntime, ClusterTrainingRuntimeSpec, JobSetTemplateSpec, MlPolicy,
    PodGroupPolicy, TemplateMetadata, TorchPolicy, TrainingRuntime, TrainingRuntimeSpec,
    TrainingRuntimeType, TRAINING_RUNTIME_TYPE_ANNOTATION,
};
pub use types::{
    find_condition, is_condition_true, preserve_unknown_fields, set_condition, Condition,
    ConditionStatus, LifeCycleState, ModelFormat, ModelFrameworkSpec, ObjectRef, StorageSpec,
};
