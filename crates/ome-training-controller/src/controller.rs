//! TrainingJob reconciliation
//!
//! One pass per event:
//! - resolve the base model, the operator ConfigMap and the runtime template
//! - make sure the job's FineTunedWeight exists; a finished job only mirrors
//!   its terminal state onto the weight
//! - provision the base model volume
//! - annotate an in-memory copy of the job and hand it to the runtime backend
//! - create or replace the backend's objects, then recompute conditions
//!
//! The status is written only when a condition changed.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn, Instrument};

use ome_common::crd::{
    ClusterBaseModel, FineTunedWeight, LifeCycleState, TrainingJob, TrainingRuntimeSpec,
};
use ome_common::events::{actions, reasons};
use ome_common::retry::RetryConfig;
use ome_common::telemetry::reconcile_span;
use ome_common::{Error, EventPublisher, INFERENCESERVICE_CONFIG_MAP_NAME};

#[cfg(test)]
use ome_common::NoopEventPublisher;

use crate::annotations::prepare_job_annotations;
use crate::client::TrainingKubeClient;
use crate::conditions::{
    set_created_condition, set_suspended_condition, set_terminal_condition, ObjectOperation,
};
use crate::fine_tuned_weight::{
    build_fine_tuned_weight, fine_tuned_weight_name, TrainingSidecarConfig,
};
use crate::runtime::{runtime_group_kind, RuntimeRegistry, TrainingRuntimeBackend};
use crate::storage::reconcile_base_model_volume;

/// Requeue after losing a FineTunedWeight creation race
const WEIGHT_CONFLICT_REQUEUE: Duration = Duration::from_secs(5);

/// Shared state for the training controller
pub struct TrainingContext {
    /// Kubernetes access
    pub kube: Arc<dyn TrainingKubeClient>,
    /// Backends keyed by runtime group-kind
    pub runtimes: RuntimeRegistry,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Namespace holding the operator ConfigMap
    pub ome_namespace: String,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
}

impl TrainingContext {
    /// Create a context with the shared retry policy
    pub fn new(
        kube: Arc<dyn TrainingKubeClient>,
        runtimes: RuntimeRegistry,
        events: Arc<dyn EventPublisher>,
        ome_namespace: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            runtimes,
            events,
            ome_namespace: ome_namespace.into(),
            retry: RetryConfig::reconcile(),
        }
    }

    /// Context with mock collaborators and events dropped
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn TrainingKubeClient>, runtimes: RuntimeRegistry) -> Self {
        Self::new(kube, runtimes, Arc::new(NoopEventPublisher), "ome")
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Reconcile a TrainingJob
pub async fn reconcile_training_job(
    job: Arc<TrainingJob>,
    ctx: Arc<TrainingContext>,
) -> Result<Action, Error> {
    let span = reconcile_span("TrainingJob", job.namespace().as_deref(), &job.name_any());
    reconcile(job.as_ref(), ctx.as_ref()).instrument(span).await
}

/// Error policy of the training controller.
///
/// Transient errors requeue at the backoff cap; everything else waits for
/// the job to change.
pub fn error_policy(job: Arc<TrainingJob>, error: &Error, ctx: Arc<TrainingContext>) -> Action {
    error!(
        ?error,
        job = %job.name_any(),
        retryable = error.is_retryable(),
        remediation = error.remediation().unwrap_or(""),
        "training job reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.retry.max_delay)
    } else {
        Action::await_change()
    }
}

// =============================================================================
// Reconcile pass
// =============================================================================

async fn reconcile(job: &TrainingJob, ctx: &TrainingContext) -> Result<Action, Error> {
    let name = job.name_any();
    let namespace = job.namespace().unwrap_or_default();
    info!(job = %name, namespace = %namespace, "reconciling TrainingJob");

    let model_name = job.input_model().ok_or_else(|| {
        Error::validation_for(name.clone(), "spec.modelConfig.inputModel is required")
    })?;
    let Some(base_model) = ctx.kube.get_cluster_base_model(model_name).await? else {
        return Err(Error::validation_for(
            name,
            format!("ClusterBaseModel {model_name} not found"),
        ));
    };

    let Some(config_map) = ctx
        .kube
        .get_config_map(&ctx.ome_namespace, INFERENCESERVICE_CONFIG_MAP_NAME)
        .await?
    else {
        warn!(
            namespace = %ctx.ome_namespace,
            name = INFERENCESERVICE_CONFIG_MAP_NAME,
            "operator ConfigMap not found"
        );
        return Ok(Action::await_change());
    };

    let runtime = resolve_runtime(ctx.kube.as_ref(), job).await?;
    let obj_ref = job.object_ref(&());

    let weight = match ensure_fine_tuned_weight(ctx, job, &obj_ref, &config_map, &runtime).await? {
        Some(weight) => weight,
        None => return Ok(Action::requeue(WEIGHT_CONFLICT_REQUEUE)),
    };

    if job.is_finished() {
        let state = if job.is_failed() {
            LifeCycleState::Failed
        } else {
            LifeCycleState::Ready
        };
        if weight.state() != Some(state) {
            info!(
                job = %name,
                weight = %weight.name_any(),
                %state,
                "training finished, updating FineTunedWeight"
            );
            ctx.kube
                .patch_fine_tuned_weight_state(&weight.name_any(), state)
                .await?;
        }
        return Ok(Action::await_change());
    }

    reconcile_base_model_volume(ctx.kube.as_ref(), job, &base_model).await?;

    let mut prepared = job.clone();
    prepare_job_annotations(&mut prepared, &base_model, &runtime)?;

    let group_kind = runtime_group_kind(&job.spec.runtime_ref);
    let backend = ctx.runtimes.get(&job.spec.runtime_ref).ok_or_else(|| {
        Error::validation_for(
            name.clone(),
            format!("the specified runtime is not supported, {group_kind}"),
        )
    })?;

    let (op, object_error) =
        reconcile_objects(ctx.kube.as_ref(), backend.as_ref(), &prepared, &runtime, &base_model)
            .await;

    let original = job.status.clone().unwrap_or_default();
    let mut status = original.clone();
    set_suspended_condition(&mut status, job);
    if set_created_condition(&mut status, op) {
        publish_created(ctx, &obj_ref, op, object_error.as_ref()).await;
    }
    let terminal = backend.terminal_condition(&prepared).await?;
    set_terminal_condition(&mut status, terminal);

    if status != original {
        debug!(job = %name, conditions = status.conditions.len(), "updating status");
        ctx.kube
            .patch_training_job_status(&namespace, &name, &status)
            .await?;
    }

    match object_error {
        Some(e) => Err(e),
        None => Ok(Action::await_change()),
    }
}

/// The namespaced runtime wins over a cluster runtime of the same name
async fn resolve_runtime(
    kube: &dyn TrainingKubeClient,
    job: &TrainingJob,
) -> Result<TrainingRuntimeSpec, Error> {
    let runtime_name = &job.spec.runtime_ref.name;
    let namespace = job.namespace().unwrap_or_default();

    if let Some(runtime) = kube.get_training_runtime(&namespace, runtime_name).await? {
        return Ok(runtime.spec);
    }
    if let Some(runtime) = kube.get_cluster_training_runtime(runtime_name).await? {
        return Ok(runtime.spec.runtime);
    }
    Err(Error::validation_for(
        job.name_any(),
        format!("No available TrainingRuntime or ClusterTrainingRuntime with the name: {runtime_name}"),
    )
    .with_remediation("create the runtime or fix spec.runtimeRef.name"))
}

/// Get the job's FineTunedWeight, creating it on first sight.
///
/// `None` means another writer created it between our get and create.
async fn ensure_fine_tuned_weight(
    ctx: &TrainingContext,
    job: &TrainingJob,
    obj_ref: &ObjectReference,
    config_map: &ConfigMap,
    runtime: &TrainingRuntimeSpec,
) -> Result<Option<FineTunedWeight>, Error> {
    let job_name = job.name_any();
    let weight_name = fine_tuned_weight_name(&job_name);
    if let Some(weight) = ctx.kube.get_fine_tuned_weight(weight_name).await? {
        let recorded = weight.spec.base_model_ref.name.as_deref();
        if recorded != job.input_model() {
            warn!(
                job = %job_name,
                weight = %weight_name,
                recorded = recorded.unwrap_or_default(),
                expected = job.input_model().unwrap_or_default(),
                "FineTunedWeight references a different base model"
            );
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Warning,
                    reasons::FINE_TUNED_WEIGHT_MISMATCH,
                    actions::VALIDATE,
                    Some(format!(
                        "FineTunedWeight '{weight_name}' references base model '{}', job uses '{}'",
                        recorded.unwrap_or_default(),
                        job.input_model().unwrap_or_default()
                    )),
                )
                .await;
        }
        return Ok(Some(weight));
    }

    let sidecar = TrainingSidecarConfig::from_config_map(config_map)?;
    let weight = build_fine_tuned_weight(job, &sidecar, runtime);

    match ctx.kube.create_fine_tuned_weight(&weight).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(weight = %weight_name, "FineTunedWeight created concurrently");
            return Ok(None);
        }
        Err(e) => {
            error!(job = %job_name, weight = %weight_name, error = %e, "failed to create FineTunedWeight");
            let mut status = job.status.clone().unwrap_or_default();
            if set_created_condition(&mut status, ObjectOperation::FineTunedWeightFailed) {
                let namespace = job.namespace().unwrap_or_default();
                if let Err(patch_err) = ctx
                    .kube
                    .patch_training_job_status(&namespace, &job_name, &status)
                    .await
                {
                    warn!(error = %patch_err, "failed to record FineTunedWeight failure");
                }
            }
            return Err(e);
        }
    }

    info!(job = %job_name, weight = %weight_name, "FineTunedWeight created");
    ctx.kube
        .patch_fine_tuned_weight_state(weight_name, LifeCycleState::Creating)
        .await?;
    ctx.events
        .publish(
            obj_ref,
            EventType::Normal,
            reasons::FINE_TUNED_WEIGHT_CREATED,
            actions::CREATE,
            Some(format!("Created FineTunedWeight '{weight_name}'")),
        )
        .await;
    Ok(Some(weight))
}

/// Create or replace every object the backend produced.
///
/// The first failure stops the pass; its outcome feeds the `Created`
/// condition and the error is returned alongside.
async fn reconcile_objects(
    kube: &dyn TrainingKubeClient,
    backend: &dyn TrainingRuntimeBackend,
    job: &TrainingJob,
    runtime: &TrainingRuntimeSpec,
    base_model: &ClusterBaseModel,
) -> (ObjectOperation, Option<Error>) {
    let objects = match backend.new_objects(job, runtime, base_model).await {
        Ok(objects) => objects,
        Err(e) => {
            error!(job = %job.name_any(), error = %e, "failed to build runtime objects");
            return (ObjectOperation::BuildFailed, Some(e));
        }
    };

    for object in &objects {
        let namespace = object
            .object
            .namespace()
            .or_else(|| job.namespace())
            .unwrap_or_default();

        if !object.exists() {
            match kube
                .create_object(&object.resource, &namespace, &object.object)
                .await
            {
                Ok(true) => {
                    info!(object = %object.display_name(), "created runtime object");
                    continue;
                }
                Ok(false) => {
                    debug!(object = %object.display_name(), "runtime object already exists, replacing");
                }
                Err(e) => {
                    error!(object = %object.display_name(), error = %e, "failed to create runtime object");
                    return (ObjectOperation::CreateFailed, Some(e));
                }
            }
        }

        if let Err(e) = kube
            .replace_object(&object.resource, &namespace, &object.object)
            .await
        {
            error!(object = %object.display_name(), error = %e, "failed to update runtime object");
            return (ObjectOperation::UpdateFailed, Some(e));
        }
        info!(object = %object.display_name(), "updated runtime object");
    }
    (ObjectOperation::Succeeded, None)
}

async fn publish_created(
    ctx: &TrainingContext,
    obj_ref: &ObjectReference,
    op: ObjectOperation,
    error: Option<&Error>,
) {
    let (type_, reason) = match op {
        ObjectOperation::Succeeded => (EventType::Normal, reasons::JOBS_CREATION_SUCCEEDED),
        ObjectOperation::BuildFailed => (EventType::Warning, reasons::JOBS_BUILD_FAILED),
        _ => (EventType::Warning, reasons::JOBS_CREATION_FAILED),
    };
    let note = match error {
        Some(e) => e.to_string(),
        None => "Created runtime objects".to_string(),
    };
    ctx.events
        .publish(obj_ref, type_, reason, actions::RECONCILE, Some(note))
        .await;
}
