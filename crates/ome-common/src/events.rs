//! Kubernetes Event recording for OME controllers.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "PVCNotFound")
    /// * `action` - What action was taken (e.g. "Validate")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event. Used by the agents and in tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Storage validation
    /// The storage URI could not be parsed as a PVC URI
    pub const INVALID_PVC_URI: &str = "InvalidPVCURI";
    /// A cluster-scoped model referenced a PVC without a namespace
    pub const NAMESPACE_REQUIRED: &str = "NamespaceRequired";
    /// A namespaced model referenced a PVC in another namespace
    pub const SECURITY_VIOLATION: &str = "SecurityViolation";
    /// The referenced PVC does not exist
    pub const PVC_NOT_FOUND: &str = "PVCNotFound";
    /// The PVC could not be read
    pub const PVC_ACCESS_FAILED: &str = "PVCAccessFailed";
    /// The PVC is not in phase Bound
    pub const PVC_NOT_BOUND: &str = "PVCNotBound";
    /// The PVC has no usable access mode
    pub const INCOMPATIBLE_ACCESS_MODES: &str = "IncompatibleAccessModes";
    /// The PVC passed every check
    pub const PVC_VALIDATED: &str = "PVCValidated";

    // Metadata extraction
    /// Metadata-extraction job created
    pub const JOB_CREATED: &str = "JobCreated";
    /// Metadata-extraction job could not be created
    pub const JOB_CREATION_FAILED: &str = "JobCreationFailed";
    /// Metadata discovered and written back to the model
    pub const METADATA_EXTRACTED: &str = "MetadataExtracted";
    /// Metadata-extraction job failed
    pub const METADATA_EXTRACTION_FAILED: &str = "MetadataExtractionFailed";
    /// Job was garbage-collected but its output ConfigMap survived
    pub const METADATA_RECOVERED: &str = "MetadataRecovered";

    // Registry validation
    /// The HuggingFace model could not be found
    pub const MODEL_NOT_FOUND: &str = "ModelNotFound";
    /// Registry validation produced a warning
    pub const VALIDATION_WARNING: &str = "ValidationWarning";

    // Training
    /// FineTunedWeight created for a training job
    pub const FINE_TUNED_WEIGHT_CREATED: &str = "FineTunedWeightCreated";
    /// Existing FineTunedWeight points at a different base model
    pub const FINE_TUNED_WEIGHT_MISMATCH: &str = "FineTunedWeightMismatch";
    /// Runtime objects created or updated
    pub const JOBS_CREATION_SUCCEEDED: &str = "JobsCreationSucceeded";
    /// Runtime objects could not be created
    pub const JOBS_CREATION_FAILED: &str = "JobsCreationFailed";
    /// Runtime objects could not be built
    pub const JOBS_BUILD_FAILED: &str = "JobsBuildFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Validating user input against the cluster
    pub const VALIDATE: &str = "Validate";
    /// Creating a dependent resource
    pub const CREATE: &str = "Create";
    /// Extracting metadata from a volume
    pub const EXTRACT: &str = "Extract";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::SECURITY_VIOLATION, "SecurityViolation");
        assert_eq!(reasons::PVC_NOT_BOUND, "PVCNotBound");
        assert_eq!(reasons::METADATA_RECOVERED, "MetadataRecovered");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::PVC_NOT_FOUND,
                actions::VALIDATE,
                Some("test".to_string()),
            )
            .await;
    }
}
