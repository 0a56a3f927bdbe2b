//! BaseModel and ClusterBaseModel reconciliation
//!
//! One reconcile pass, shared by both kinds:
//! - deletion: wait for every node to report `Deleted`, then drop the finalizer
//! - `hf://` storage: probe the registry at most once a day
//! - `pvc://` storage: validate the claim and run the metadata-extraction Job
//! - aggregate per-node ConfigMap entries into the status
//!
//! Spec, annotations and status are written once at the end of the pass and
//! only when they changed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn, Instrument};

use ome_common::crd::{
    set_condition, BaseModel, BaseModelSpec, BaseModelStatus, ClusterBaseModel, Condition,
    ConditionStatus, LifeCycleState, ModelResource, StorageSpec,
};
use ome_common::events::{actions, reasons};
use ome_common::model_entry::ModelConfig;
use ome_common::retry::{RetryConfig, RetryContext};
use ome_common::storage_uri::{storage_type, StorageType};
use ome_common::telemetry::reconcile_span;
use ome_common::{Error, EventPublisher};

#[cfg(test)]
use ome_common::NoopEventPublisher;

use crate::client::{ModelKubeClient, ModelRef};
use crate::metadata_job::{
    build_metadata_job, metadata_config_map_name, metadata_job_name, observe_job,
    JobObservation, MetadataJobParams,
};
use crate::pvc::{security_condition, validate_pvc};
use crate::registry::{validate_storage_uri, ModelRegistry, DEFAULT_SECRET_TOKEN_KEY};
use crate::status::{collect_node_status, nodes_pending_deletion};

/// Condition set once the extraction Job has been submitted
pub const JOB_CREATED_CONDITION: &str = "JobCreated";
/// Condition set once discovered metadata has been read
pub const METADATA_EXTRACTED_CONDITION: &str = "MetadataExtracted";
/// Condition describing a pending retry of a transient failure
pub const RETRYING_CONDITION: &str = "Retrying";
/// Condition set when the extraction Job failed
pub const JOB_FAILED_CONDITION: &str = "JobFailed";

/// Storage parameter overriding the Secret key holding the registry token
pub const SECRET_KEY_PARAMETER: &str = "secretKey";

/// Requeue while nodes still report the model as not deleted
const DELETION_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue when the status ConfigMaps could not be listed during deletion
const DELETION_LIST_ERROR_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue while the extraction Job runs (or was just created)
const JOB_RUNNING_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue while the extraction Job has no pod yet
const JOB_PENDING_REQUEUE: Duration = Duration::from_secs(15);
/// Requeue while no node has reported a terminal state.
///
/// Node reports also arrive through the status ConfigMap watch, so this is a
/// slow safety poll.
const IN_TRANSIT_REQUEUE: Duration = Duration::from_secs(30);

/// Correlation id prefix for model reconciles
const CORRELATION_PREFIX: &str = "pvc";

/// Shared state for the model controllers
pub struct ModelContext {
    /// Kubernetes access
    pub kube: Arc<dyn ModelKubeClient>,
    /// External model registry used for `hf://` storage
    pub registry: Arc<dyn ModelRegistry>,
    /// Event publisher for user-visible failures
    pub events: Arc<dyn EventPublisher>,
    /// Namespace holding the per-node status ConfigMaps
    pub status_namespace: String,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
    /// Image of the metadata-extraction Job
    pub agent_image: String,
}

impl ModelContext {
    /// Create a context with the shared retry policy
    pub fn new(
        kube: Arc<dyn ModelKubeClient>,
        registry: Arc<dyn ModelRegistry>,
        events: Arc<dyn EventPublisher>,
        status_namespace: impl Into<String>,
        agent_image: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            registry,
            events,
            status_namespace: status_namespace.into(),
            retry: RetryConfig::reconcile(),
            agent_image: agent_image.into(),
        }
    }

    /// Context with mock collaborators and events dropped
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ModelKubeClient>, registry: Arc<dyn ModelRegistry>) -> Self {
        Self::new(
            kube,
            registry,
            Arc::new(NoopEventPublisher),
            "ome",
            "ghcr.io/sgl-project/ome/ome-agent:test",
        )
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Reconcile a namespaced BaseModel
pub async fn reconcile_base_model(
    model: Arc<BaseModel>,
    ctx: Arc<ModelContext>,
) -> Result<Action, Error> {
    let span = reconcile_span(BaseModel::KIND, model.namespace().as_deref(), &model.name_any());
    reconcile_model(model.as_ref(), ctx.as_ref())
        .instrument(span)
        .await
}

/// Reconcile a ClusterBaseModel
pub async fn reconcile_cluster_base_model(
    model: Arc<ClusterBaseModel>,
    ctx: Arc<ModelContext>,
) -> Result<Action, Error> {
    let span = reconcile_span(ClusterBaseModel::KIND, None, &model.name_any());
    reconcile_model(model.as_ref(), ctx.as_ref())
        .instrument(span)
        .await
}

/// Error policy shared by both model controllers.
///
/// Transient errors requeue at the backoff cap; everything else waits for
/// the object to change.
pub fn error_policy<K: ModelResource>(model: Arc<K>, error: &Error, ctx: Arc<ModelContext>) -> Action {
    error!(
        ?error,
        kind = K::KIND,
        model = %model.name_any(),
        retryable = error.is_retryable(),
        remediation = error.remediation().unwrap_or(""),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.retry.max_delay)
    } else {
        Action::await_change()
    }
}

fn model_ref<K: ModelResource>(model: &K) -> ModelRef {
    let name = model.name_any();
    match model.namespace() {
        Some(ns) if !K::is_cluster_scoped() => ModelRef::base_model(&ns, &name),
        _ => ModelRef::cluster_base_model(&name),
    }
}

fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

// =============================================================================
// Reconcile pass
// =============================================================================

/// Working copy of everything one pass may change
struct Pass {
    spec: BaseModelSpec,
    status: BaseModelStatus,
    retry: RetryContext,
    requeue: Option<Duration>,
}

impl Pass {
    fn requeue_after(&mut self, delay: Duration) {
        self.requeue = earliest(self.requeue, Some(delay));
    }

    fn propagate(&mut self, config: &ModelConfig) {
        if self.spec.apply_discovered(config) {
            debug!("backfilled spec from discovered metadata");
        }
    }
}

async fn reconcile_model<K: ModelResource>(model: &K, ctx: &ModelContext) -> Result<Action, Error> {
    let target = model_ref(model);

    if model.meta().deletion_timestamp.is_some() {
        return handle_deletion(model, &target, ctx).await;
    }

    if !model.finalizers().iter().any(|f| f == K::FINALIZER) {
        ctx.kube.add_finalizer(&target, K::FINALIZER).await?;
    }

    let original_retry = RetryContext::from_annotations(model.meta().annotations.as_ref());
    let mut pass = Pass {
        spec: model.model_spec().clone(),
        status: model.model_status().cloned().unwrap_or_default(),
        retry: original_retry.clone(),
        requeue: None,
    };
    let correlation_id = pass.retry.ensure_correlation_id(CORRELATION_PREFIX).to_string();
    tracing::Span::current().record("correlation_id", correlation_id.as_str());

    info!(model = %target, "reconciling {}", K::KIND);

    let obj_ref = model.object_ref(&());
    let mut deferred: Option<Error> = None;

    if let Some(uri) = pass.spec.storage_uri().map(str::to_string) {
        match storage_type(&uri) {
            Ok(StorageType::HuggingFace) => {
                reconcile_registry(model, ctx, &obj_ref, &uri, &mut pass).await;
            }
            Ok(StorageType::Pvc) if !pass.spec.has_discovered_metadata() => {
                if let Err(e) = reconcile_pvc_storage(model, ctx, &obj_ref, &uri, &mut pass).await {
                    deferred = Some(e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!(storage_uri = %uri, error = %e, "unrecognized storage URI"),
        }
    }

    let aggregate =
        collect_node_status(ctx.kube.as_ref(), &ctx.status_namespace, &model.model_key()).await?;
    for config in &aggregate.configs {
        pass.propagate(config);
    }
    pass.status.state = aggregate.state();
    pass.status.nodes_ready = aggregate.nodes_ready;
    pass.status.nodes_failed = aggregate.nodes_failed;

    persist(model, &target, ctx, &pass, &original_retry).await?;

    if let Some(e) = deferred {
        return Err(e);
    }

    if pass.status.state == LifeCycleState::InTransit {
        pass.requeue_after(IN_TRANSIT_REQUEUE);
    }
    Ok(match pass.requeue {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

async fn persist<K: ModelResource>(
    model: &K,
    target: &ModelRef,
    ctx: &ModelContext,
    pass: &Pass,
    original_retry: &RetryContext,
) -> Result<(), Error> {
    if &pass.spec != model.model_spec() {
        info!(model = %target, "updating spec with discovered metadata");
        ctx.kube.patch_spec(target, &pass.spec).await?;
    }

    if &pass.retry != original_retry {
        ctx.kube
            .patch_annotations(target, &pass.retry.to_annotations())
            .await?;
    }

    let current = model.model_status().cloned().unwrap_or_default();
    if pass.status != current {
        debug!(
            model = %target,
            state = ?pass.status.state,
            ready = pass.status.nodes_ready.len(),
            failed = pass.status.nodes_failed.len(),
            "updating status"
        );
        ctx.kube.patch_status(target, &pass.status).await?;
    }
    Ok(())
}

// =============================================================================
// Deletion
// =============================================================================

async fn handle_deletion<K: ModelResource>(
    model: &K,
    target: &ModelRef,
    ctx: &ModelContext,
) -> Result<Action, Error> {
    if !model.finalizers().iter().any(|f| f == K::FINALIZER) {
        return Ok(Action::await_change());
    }

    let config_maps = match ctx
        .kube
        .list_model_status_config_maps(&ctx.status_namespace)
        .await
    {
        Ok(cms) => cms,
        Err(e) => {
            warn!(model = %target, error = %e, "failed to list status ConfigMaps during deletion");
            return Ok(Action::requeue(DELETION_LIST_ERROR_REQUEUE));
        }
    };

    let pending = nodes_pending_deletion(&config_maps, &model.model_key());
    if !pending.is_empty() {
        info!(
            model = %target,
            nodes = ?pending,
            "waiting for nodes to remove the model before releasing finalizer"
        );
        return Ok(Action::requeue(DELETION_REQUEUE));
    }

    info!(model = %target, "all nodes report the model deleted, removing finalizer");
    ctx.kube.remove_finalizer(target, K::FINALIZER).await?;
    Ok(Action::await_change())
}

// =============================================================================
// HuggingFace registry
// =============================================================================

async fn reconcile_registry<K: ModelResource>(
    model: &K,
    ctx: &ModelContext,
    obj_ref: &ObjectReference,
    uri: &str,
    pass: &mut Pass,
) {
    let secret_namespace = if K::is_cluster_scoped() {
        ctx.status_namespace.clone()
    } else {
        model.namespace().unwrap_or_default()
    };
    let token = match pass.spec.storage.as_ref() {
        Some(storage) => registry_token(ctx.kube.as_ref(), &secret_namespace, storage).await,
        None => None,
    };

    let previous = pass.status.validation.clone();
    let validation = validate_storage_uri(
        ctx.registry.as_ref(),
        uri,
        token,
        previous.as_ref(),
        Utc::now(),
    )
    .await;

    let refreshed = previous.as_ref().map(|p| p.last_checked) != Some(validation.last_checked);
    if refreshed && !validation.valid {
        ctx.events
            .publish(
                obj_ref,
                EventType::Warning,
                reasons::VALIDATION_WARNING,
                actions::VALIDATE,
                validation.message.clone(),
            )
            .await;
    }
    pass.status.validation = Some(validation);
}

/// Registry token from the Secret named by the storage key.
///
/// Failures are logged and validation proceeds anonymously.
async fn registry_token(
    kube: &dyn ModelKubeClient,
    namespace: &str,
    storage: &StorageSpec,
) -> Option<String> {
    let secret = storage.storage_key.as_deref().filter(|s| !s.is_empty())?;
    let key = storage
        .parameters
        .get(SECRET_KEY_PARAMETER)
        .map(String::as_str)
        .unwrap_or(DEFAULT_SECRET_TOKEN_KEY);

    match kube.get_secret_value(namespace, secret, key).await {
        Ok(Some(token)) if !token.is_empty() => Some(token),
        Ok(_) => {
            warn!(secret, key, "registry token secret or key missing, validating without token");
            None
        }
        Err(e) => {
            warn!(secret, error = %e, "failed to read registry token, validating without token");
            None
        }
    }
}

// =============================================================================
// PVC storage and metadata extraction
// =============================================================================

/// Retry a transient failure if the budget allows, else hand the error back
fn schedule_retry(ctx: &ModelContext, pass: &mut Pass, error: Error) -> Result<(), Error> {
    if !error.is_retryable() || !ctx.retry.should_retry(pass.retry.retry_count) {
        return Err(error);
    }
    let delay = ctx.retry.backoff_delay(pass.retry.retry_count);
    pass.retry.record_failure(&ctx.retry);
    warn!(
        retry = pass.retry.retry_count,
        max = ctx.retry.max_attempts,
        delay_secs = delay.as_secs(),
        error = %error,
        "transient failure, retrying"
    );
    set_condition(
        &mut pass.status.conditions,
        Condition::new(
            RETRYING_CONDITION,
            ConditionStatus::True,
            "TransientError",
            format!(
                "Retry {}/{} after {}s: {error}",
                pass.retry.retry_count,
                ctx.retry.max_attempts,
                delay.as_secs()
            ),
        ),
    );
    pass.requeue_after(delay);
    Ok(())
}

fn clear_retry(pass: &mut Pass) {
    pass.retry.reset();
    pass.status
        .conditions
        .retain(|c| c.type_ != RETRYING_CONDITION);
}

async fn reconcile_pvc_storage<K: ModelResource>(
    model: &K,
    ctx: &ModelContext,
    obj_ref: &ObjectReference,
    uri: &str,
    pass: &mut Pass,
) -> Result<(), Error> {
    let name = model.name_any();
    let model_namespace = if K::is_cluster_scoped() {
        None
    } else {
        model.namespace()
    };

    let outcome = validate_pvc(ctx.kube.as_ref(), &name, model_namespace.as_deref(), uri).await;
    if let Some(condition) = security_condition(&outcome) {
        set_condition(&mut pass.status.conditions, condition);
    }

    let validated = match outcome {
        Ok(v) => v,
        Err(rejection) => {
            set_condition(&mut pass.status.conditions, rejection.condition());
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Warning,
                    rejection.check.event_reason(),
                    actions::VALIDATE,
                    Some(rejection.event_message.clone()),
                )
                .await;
            return schedule_retry(ctx, pass, rejection.error);
        }
    };

    if set_condition(&mut pass.status.conditions, validated.condition()) {
        ctx.events
            .publish(
                obj_ref,
                EventType::Normal,
                reasons::PVC_VALIDATED,
                actions::VALIDATE,
                Some(format!("PVC '{}' validated successfully", validated.name())),
            )
            .await;
    }

    // Retry budget covers Job creation too; cleared once the Job exists.
    let namespace = validated.namespace.clone();
    let job_name = metadata_job_name(&name);
    let job = ctx.kube.get_job(&namespace, &job_name).await?;
    let output = ctx
        .kube
        .get_config_map(&namespace, &metadata_config_map_name(&name))
        .await?;

    match observe_job(job.as_ref(), output.as_ref(), Utc::now()) {
        JobObservation::Missing => {
            let owner = model
                .controller_owner_ref(&())
                .ok_or_else(|| Error::internal_with_context(K::KIND, "model has no uid"))?;
            let job = build_metadata_job(&MetadataJobParams {
                model_name: name.clone(),
                model_namespace: model_namespace.clone(),
                owner_label: K::OWNER_LABEL,
                owner,
                namespace: namespace.clone(),
                pvc_name: validated.storage.pvc_name.clone(),
                sub_path: validated.storage.sub_path.clone(),
                storage_uri: uri.to_string(),
                image: ctx.agent_image.clone(),
            });

            match ctx.kube.create_job(&namespace, &job).await {
                Ok(()) => {
                    info!(job = %job_name, namespace = %namespace, "created metadata extraction job");
                    ctx.events
                        .publish(
                            obj_ref,
                            EventType::Normal,
                            reasons::JOB_CREATED,
                            actions::CREATE,
                            Some(format!("Created metadata extraction job '{job_name}'")),
                        )
                        .await;
                    set_condition(
                        &mut pass.status.conditions,
                        Condition::new(
                            JOB_CREATED_CONDITION,
                            ConditionStatus::True,
                            "JobCreated",
                            format!("Metadata extraction job '{job_name}' created"),
                        ),
                    );
                    clear_retry(pass);
                    pass.requeue_after(JOB_RUNNING_REQUEUE);
                    Ok(())
                }
                Err(e) => {
                    ctx.events
                        .publish(
                            obj_ref,
                            EventType::Warning,
                            reasons::JOB_CREATION_FAILED,
                            actions::CREATE,
                            Some(format!("Failed to create metadata extraction job: {e}")),
                        )
                        .await;
                    schedule_retry(ctx, pass, e)
                }
            }
        }
        JobObservation::Recovered(config) => {
            info!(job = %job_name, "job already cleaned up, using its metadata ConfigMap");
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Normal,
                    reasons::METADATA_RECOVERED,
                    actions::EXTRACT,
                    Some("Recovered metadata from a completed extraction".to_string()),
                )
                .await;
            mark_extracted(pass, &config, reasons::METADATA_RECOVERED);
            Ok(())
        }
        JobObservation::Succeeded {
            config,
            elapsed_secs,
        } => {
            info!(job = %job_name, elapsed_secs, "metadata extraction succeeded");
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Normal,
                    reasons::METADATA_EXTRACTED,
                    actions::EXTRACT,
                    Some(format!("Metadata extracted in {elapsed_secs}s")),
                )
                .await;
            mark_extracted(pass, &config, reasons::METADATA_EXTRACTED);
            Ok(())
        }
        JobObservation::Running { elapsed_secs } => {
            info!(job = %job_name, elapsed_secs, "metadata extraction job still running");
            clear_retry(pass);
            pass.requeue_after(JOB_RUNNING_REQUEUE);
            Ok(())
        }
        JobObservation::Pending => {
            debug!(job = %job_name, "metadata extraction job pending");
            clear_retry(pass);
            pass.requeue_after(JOB_PENDING_REQUEUE);
            Ok(())
        }
        JobObservation::Failed { reason } => {
            ctx.events
                .publish(
                    obj_ref,
                    EventType::Warning,
                    reasons::METADATA_EXTRACTION_FAILED,
                    actions::EXTRACT,
                    Some(reason.clone()),
                )
                .await;
            set_condition(
                &mut pass.status.conditions,
                Condition::new(
                    JOB_FAILED_CONDITION,
                    ConditionStatus::True,
                    reasons::METADATA_EXTRACTION_FAILED,
                    reason.clone(),
                ),
            );
            set_condition(
                &mut pass.status.conditions,
                Condition::new(
                    METADATA_EXTRACTED_CONDITION,
                    ConditionStatus::False,
                    reasons::METADATA_EXTRACTION_FAILED,
                    reason.clone(),
                ),
            );
            Err(Error::validation_for(
                name,
                format!("metadata extraction job failed: {reason}"),
            ))
        }
    }
}

fn mark_extracted(pass: &mut Pass, config: &ModelConfig, reason: &str) {
    clear_retry(pass);
    pass.propagate(config);
    pass.status
        .conditions
        .retain(|c| c.type_ != JOB_FAILED_CONDITION);
    set_condition(
        &mut pass.status.conditions,
        Condition::new(
            METADATA_EXTRACTED_CONDITION,
            ConditionStatus::True,
            reason,
            "Model metadata discovered from storage",
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockModelKubeClient;
    use crate::pvc::{condition_reasons, PVC_VALIDATED_CONDITION};
    use crate::registry::{MockModelRegistry, RegistryValidation, VALIDATION_SUCCESS_MESSAGE};
    use async_trait::async_trait;
    use k8s_openapi::api::batch::v1::{Job, JobStatus};
    use k8s_openapi::api::core::v1::{
        ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use ome_common::crd::{find_condition, StorageValidationStatus};
    use ome_common::retry::{CORRELATION_ID_ANNOTATION, RETRY_COUNT_ANNOTATION};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records event reasons for assertions
    #[derive(Default)]
    struct RecordingPublisher {
        reasons: Mutex<Vec<String>>,
    }

    impl RecordingPublisher {
        fn reasons(&self) -> Vec<String> {
            self.reasons.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    fn base_model(namespace: &str, name: &str, uri: &str) -> BaseModel {
        let mut model = BaseModel::new(
            name,
            BaseModelSpec {
                storage: Some(StorageSpec {
                    storage_uri: Some(uri.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        model.metadata.namespace = Some(namespace.to_string());
        model.metadata.uid = Some("uid-1".to_string());
        model.metadata.finalizers = Some(vec![BaseModel::FINALIZER.to_string()]);
        model.metadata.annotations = Some(BTreeMap::from([(
            CORRELATION_ID_ANNOTATION.to_string(),
            "pvc-1-abcd".to_string(),
        )]));
        model
    }

    fn bound_pvc() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                access_modes: Some(vec!["ReadOnlyMany".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn metadata_cm() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("llama-metadata".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("modelType".to_string(), "llama".to_string()),
                ("modelArchitecture".to_string(), "LlamaForCausalLM".to_string()),
                ("maxTokens".to_string(), "8192".to_string()),
            ])),
            ..Default::default()
        }
    }

    fn status_cm(node: &str, key: &str, entry: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(node.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), entry.to_string())])),
            ..Default::default()
        }
    }

    fn no_nodes(kube: &mut MockModelKubeClient) {
        kube.expect_list_model_status_config_maps()
            .returning(|_| Ok(vec![]));
    }

    fn ctx_with(
        kube: MockModelKubeClient,
        registry: MockModelRegistry,
        events: Arc<RecordingPublisher>,
    ) -> Arc<ModelContext> {
        let mut ctx = ModelContext::for_testing(Arc::new(kube), Arc::new(registry));
        ctx.events = events;
        Arc::new(ctx)
    }

    /// Story: a new hf:// model is validated against the registry
    #[tokio::test]
    async fn story_new_hf_model_is_validated() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_patch_status()
            .withf(|_, status| {
                let v = status.validation.as_ref().unwrap();
                v.valid
                    && v.message.as_deref() == Some(VALIDATION_SUCCESS_MESSAGE)
                    && status.state == LifeCycleState::InTransit
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut registry = MockModelRegistry::new();
        registry
            .expect_validate()
            .withf(|id, token| id == "mistralai/Mistral-7B" && token.is_none())
            .times(1)
            .returning(|_, _| RegistryValidation {
                valid: true,
                exists: true,
                ..Default::default()
            });

        let model = Arc::new(base_model("team-a", "mistral", "hf://mistralai/Mistral-7B"));
        let ctx = Arc::new(ModelContext::for_testing(Arc::new(kube), Arc::new(registry)));

        let action = reconcile_base_model(model, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(IN_TRANSIT_REQUEUE));
    }

    /// Story: a fresh validation is not repeated
    #[tokio::test]
    async fn story_recent_validation_skips_registry() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_patch_status().never();

        let mut registry = MockModelRegistry::new();
        registry.expect_validate().never();

        let mut model = base_model("team-a", "mistral", "hf://mistralai/Mistral-7B");
        model.status = Some(BaseModelStatus {
            validation: Some(StorageValidationStatus {
                last_checked: Some(Utc::now()),
                valid: true,
                message: Some(VALIDATION_SUCCESS_MESSAGE.to_string()),
            }),
            ..Default::default()
        });
        let ctx = Arc::new(ModelContext::for_testing(Arc::new(kube), Arc::new(registry)));

        reconcile_base_model(Arc::new(model), ctx).await.unwrap();
    }

    /// Story: the registry token is read from the referenced Secret
    #[tokio::test]
    async fn story_registry_token_from_secret() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_get_secret_value()
            .withf(|ns, name, key| ns == "team-a" && name == "hf-secret" && key == "hf-token")
            .returning(|_, _, _| Ok(Some("s3cr3t".to_string())));
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let mut registry = MockModelRegistry::new();
        registry
            .expect_validate()
            .withf(|_, token| token.as_deref() == Some("s3cr3t"))
            .times(1)
            .returning(|_, _| RegistryValidation {
                valid: true,
                exists: true,
                ..Default::default()
            });

        let mut model = base_model("team-a", "llama", "hf://meta-llama/Llama-3.1-8B");
        if let Some(storage) = model.spec.storage.as_mut() {
            storage.storage_key = Some("hf-secret".to_string());
            storage
                .parameters
                .insert(SECRET_KEY_PARAMETER.to_string(), "hf-token".to_string());
        }
        let ctx = Arc::new(ModelContext::for_testing(Arc::new(kube), Arc::new(registry)));

        reconcile_base_model(Arc::new(model), ctx).await.unwrap();
    }

    /// Story: cross-namespace claims are refused as a security violation
    #[tokio::test]
    async fn story_cross_namespace_pvc_is_denied() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_get_pvc().never();
        kube.expect_patch_status()
            .withf(|_, status| {
                let c = find_condition(&status.conditions, PVC_VALIDATED_CONDITION).unwrap();
                c.status == ConditionStatus::False
                    && c.reason == condition_reasons::CROSS_NAMESPACE_ACCESS_DENIED
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let events = Arc::new(RecordingPublisher::default());
        let model = Arc::new(base_model("ns-a", "llama", "pvc://ns-b:claim-x"));
        let ctx = ctx_with(kube, MockModelRegistry::new(), events.clone());

        let err = reconcile_base_model(model, ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(events.reasons(), vec![reasons::SECURITY_VIOLATION]);
    }

    /// Story: a bound claim without a Job gets an extraction Job
    #[tokio::test]
    async fn story_metadata_job_is_created() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_get_pvc()
            .withf(|ns, name| ns == "team-a" && name == "models")
            .returning(|_, _| Ok(Some(bound_pvc())));
        kube.expect_get_job().returning(|_, _| Ok(None));
        kube.expect_get_config_map().returning(|_, _| Ok(None));
        kube.expect_create_job()
            .withf(|ns, job| {
                ns == "team-a"
                    && job.metadata.name.as_deref() == Some("llama-metadata-extraction")
                    && job
                        .metadata
                        .owner_references
                        .as_ref()
                        .is_some_and(|o| o[0].uid == "uid-1")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let events = Arc::new(RecordingPublisher::default());
        let model = Arc::new(base_model("team-a", "llama", "pvc://team-a:models/llama-3"));
        let ctx = ctx_with(kube, MockModelRegistry::new(), events.clone());

        let action = reconcile_base_model(model, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(IN_TRANSIT_REQUEUE));
        assert_eq!(
            events.reasons(),
            vec![reasons::PVC_VALIDATED, reasons::JOB_CREATED]
        );
    }

    /// Story: a TTL-collected Job's output is used without recreating it
    #[tokio::test]
    async fn story_ttl_cleaned_job_is_recovered() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_get_pvc().returning(|_, _| Ok(Some(bound_pvc())));
        kube.expect_get_job().returning(|_, _| Ok(None));
        kube.expect_get_config_map()
            .withf(|_, name| name == "llama-metadata")
            .returning(|_, _| Ok(Some(metadata_cm())));
        kube.expect_create_job().never();
        kube.expect_patch_spec()
            .withf(|_, spec| {
                spec.model_type.as_deref() == Some("llama") && spec.max_tokens == Some(8192)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_status()
            .withf(|_, status| {
                find_condition(&status.conditions, METADATA_EXTRACTED_CONDITION)
                    .is_some_and(|c| c.is_true())
            })
            .returning(|_, _| Ok(()));

        let events = Arc::new(RecordingPublisher::default());
        let model = Arc::new(base_model("team-a", "llama", "pvc://team-a:models"));
        let ctx = ctx_with(kube, MockModelRegistry::new(), events.clone());

        reconcile_base_model(model, ctx).await.unwrap();
        assert!(events
            .reasons()
            .contains(&reasons::METADATA_RECOVERED.to_string()));
    }

    /// Story: a failed extraction surfaces as a permanent error
    #[tokio::test]
    async fn story_failed_job_is_fatal() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_get_pvc().returning(|_, _| Ok(Some(bound_pvc())));
        kube.expect_get_job().returning(|_, _| {
            Ok(Some(Job {
                status: Some(JobStatus {
                    failed: Some(3),
                    start_time: Some(Time(Utc::now())),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        kube.expect_get_config_map().returning(|_, _| Ok(None));
        kube.expect_patch_status().times(1).returning(|_, _| Ok(()));

        let model = Arc::new(base_model("team-a", "llama", "pvc://team-a:models"));
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let err = reconcile_base_model(model, ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err
            .to_string()
            .contains("metadata extraction job failed: Job failed after 3 attempts"));
    }

    /// Story: transient claim lookups retry with backoff and count attempts
    #[tokio::test]
    async fn story_transient_pvc_failure_retries() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_get_pvc()
            .returning(|_, _| Err(Error::transient("connection reset")));
        kube.expect_patch_annotations()
            .withf(|_, annotations| {
                annotations.get(RETRY_COUNT_ANNOTATION).map(String::as_str) == Some("1")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let model = Arc::new(base_model("team-a", "llama", "pvc://team-a:models"));
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let action = reconcile_base_model(model, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(2)));
    }

    /// Story: once the retry budget is spent the error propagates
    #[tokio::test]
    async fn story_retry_budget_exhausted() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_get_pvc()
            .returning(|_, _| Err(Error::transient("connection reset")));
        kube.expect_patch_annotations().never();
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let mut model = base_model("team-a", "llama", "pvc://team-a:models");
        if let Some(annotations) = model.metadata.annotations.as_mut() {
            annotations.insert(RETRY_COUNT_ANNOTATION.to_string(), "3".to_string());
        }
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let err = reconcile_base_model(Arc::new(model), ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }

    fn failing_job_creation(kube: &mut MockModelKubeClient) {
        kube.expect_get_pvc().returning(|_, _| Ok(Some(bound_pvc())));
        kube.expect_get_job().returning(|_, _| Ok(None));
        kube.expect_get_config_map().returning(|_, _| Ok(None));
        kube.expect_create_job()
            .times(1)
            .returning(|_, _| Err(Error::transient("apiserver unavailable")));
    }

    fn with_retry_count(mut model: BaseModel, count: &str) -> BaseModel {
        if let Some(annotations) = model.metadata.annotations.as_mut() {
            annotations.insert(RETRY_COUNT_ANNOTATION.to_string(), count.to_string());
        }
        model
    }

    /// Story: repeated Job creation failures back off and keep counting
    #[tokio::test]
    async fn story_job_creation_failure_keeps_counting() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        failing_job_creation(&mut kube);
        kube.expect_patch_annotations()
            .withf(|_, annotations| {
                annotations.get(RETRY_COUNT_ANNOTATION).map(String::as_str) == Some("2")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let model = with_retry_count(base_model("team-a", "llama", "pvc://team-a:models"), "1");
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let action = reconcile_base_model(Arc::new(model), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(4)));
    }

    /// Story: a validated claim does not refill the Job creation budget
    #[tokio::test]
    async fn story_job_creation_budget_exhausted() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        failing_job_creation(&mut kube);
        kube.expect_patch_annotations().never();
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let model = with_retry_count(base_model("team-a", "llama", "pvc://team-a:models"), "3");
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let err = reconcile_base_model(Arc::new(model), ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }

    /// Story: node reports drive the lifecycle state
    #[tokio::test]
    async fn story_node_reports_make_model_ready() {
        let mut kube = MockModelKubeClient::new();
        kube.expect_list_model_status_config_maps().returning(|_| {
            Ok(vec![
                status_cm("gpu-1", "team-a.basemodel.llama", r#"{"status":"Ready"}"#),
                status_cm("gpu-2", "team-a.basemodel.llama", "Failed"),
            ])
        });
        kube.expect_node_exists().returning(|_| Ok(true));
        kube.expect_patch_status()
            .withf(|_, status| {
                status.state == LifeCycleState::Ready
                    && status.nodes_ready == vec!["gpu-1"]
                    && status.nodes_failed == vec!["gpu-2"]
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let model = Arc::new(base_model("team-a", "llama", "oci://n/ns/b/bucket/o/llama"));
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let action = reconcile_base_model(model, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a converged model produces no writes
    #[tokio::test]
    async fn story_converged_model_is_left_alone() {
        let mut kube = MockModelKubeClient::new();
        kube.expect_list_model_status_config_maps().returning(|_| {
            Ok(vec![status_cm("gpu-1", "team-a.basemodel.llama", "Ready")])
        });
        kube.expect_node_exists().returning(|_| Ok(true));
        kube.expect_add_finalizer().never();
        kube.expect_patch_spec().never();
        kube.expect_patch_annotations().never();
        kube.expect_patch_status().never();

        let mut model = base_model("team-a", "llama", "oci://n/ns/b/bucket/o/llama");
        model.status = Some(BaseModelStatus {
            state: LifeCycleState::Ready,
            nodes_ready: vec!["gpu-1".to_string()],
            ..Default::default()
        });
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        reconcile_base_model(Arc::new(model), ctx).await.unwrap();
    }

    /// Story: a new model gets the finalizer and a correlation id
    #[tokio::test]
    async fn story_new_model_gets_finalizer() {
        let mut kube = MockModelKubeClient::new();
        no_nodes(&mut kube);
        kube.expect_add_finalizer()
            .withf(|target, f| target.name == "llama" && f == BaseModel::FINALIZER)
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_annotations()
            .withf(|_, annotations| {
                annotations
                    .get(CORRELATION_ID_ANNOTATION)
                    .is_some_and(|id| id.starts_with("pvc-"))
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let mut model = base_model("team-a", "llama", "oci://n/ns/b/bucket/o/llama");
        model.metadata.finalizers = None;
        model.metadata.annotations = None;
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        reconcile_base_model(Arc::new(model), ctx).await.unwrap();
    }

    /// Story: deletion waits until every node reports Deleted
    #[tokio::test]
    async fn story_deletion_waits_for_nodes() {
        let mut kube = MockModelKubeClient::new();
        kube.expect_list_model_status_config_maps().returning(|_| {
            Ok(vec![
                status_cm("gpu-1", "clusterbasemodel.mistral", "Deleted"),
                status_cm("gpu-2", "clusterbasemodel.mistral", "Ready"),
            ])
        });
        kube.expect_remove_finalizer().never();

        let mut model = ClusterBaseModel::new("mistral", Default::default());
        model.metadata.finalizers = Some(vec![ClusterBaseModel::FINALIZER.to_string()]);
        model.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let action = reconcile_cluster_base_model(Arc::new(model), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(DELETION_REQUEUE));
    }

    /// Story: the finalizer is released once all nodes report Deleted
    #[tokio::test]
    async fn story_deletion_releases_finalizer() {
        let mut kube = MockModelKubeClient::new();
        kube.expect_list_model_status_config_maps().returning(|_| {
            Ok(vec![status_cm(
                "gpu-1",
                "clusterbasemodel.mistral",
                r#"{"status":"Deleted"}"#,
            )])
        });
        kube.expect_node_exists().never();
        kube.expect_remove_finalizer()
            .withf(|target, f| target.namespace.is_none() && f == ClusterBaseModel::FINALIZER)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut model = ClusterBaseModel::new("mistral", Default::default());
        model.metadata.finalizers = Some(vec![ClusterBaseModel::FINALIZER.to_string()]);
        model.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let action = reconcile_cluster_base_model(Arc::new(model), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_deletion_list_error_requeues() {
        let mut kube = MockModelKubeClient::new();
        kube.expect_list_model_status_config_maps()
            .returning(|_| Err(Error::transient("api down")));
        kube.expect_remove_finalizer().never();

        let mut model = base_model("team-a", "llama", "oci://n/ns/b/bucket/o/llama");
        model.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(kube),
            Arc::new(MockModelRegistry::new()),
        ));

        let action = reconcile_base_model(Arc::new(model), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(DELETION_LIST_ERROR_REQUEUE));
    }

    #[test]
    fn test_error_policy_by_kind() {
        let model = Arc::new(base_model("team-a", "llama", "hf://a/b"));
        let ctx = Arc::new(ModelContext::for_testing(
            Arc::new(MockModelKubeClient::new()),
            Arc::new(MockModelRegistry::new()),
        ));

        let transient = error_policy(model.clone(), &Error::transient("x"), ctx.clone());
        assert_eq!(transient, Action::requeue(Duration::from_secs(300)));

        let permanent = error_policy(model, &Error::validation("x"), ctx);
        assert_eq!(permanent, Action::await_change());
    }
}
