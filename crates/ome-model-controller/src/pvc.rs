//! PersistentVolumeClaim validation
//!
//! Before a metadata-extraction job may mount a claim, the claim must exist,
//! be Bound, expose a usable access mode and, for namespaced models, live in
//! the model's own namespace.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::{debug, warn};

use ome_common::crd::{Condition, ConditionStatus};
use ome_common::events::reasons;
use ome_common::storage_uri::{parse_pvc, PvcStorage};
use ome_common::Error;

use crate::client::ModelKubeClient;

/// Condition type recording the outcome of claim validation
pub const PVC_VALIDATED_CONDITION: &str = "PVCValidated";

/// Condition type recording the namespace boundary check
pub const PVC_SECURITY_VALIDATED_CONDITION: &str = "PVCSecurityValidated";

/// Access modes a model volume may be mounted with
const COMPATIBLE_ACCESS_MODES: [&str; 3] = ["ReadWriteOnce", "ReadOnlyMany", "ReadWriteMany"];

/// Condition reason codes
pub mod condition_reasons {
    /// Every check passed
    pub const VALIDATION_SUCCEEDED: &str = "ValidationSucceeded";
    /// The URI is not a valid PVC URI
    pub const INVALID_URI: &str = "InvalidPVCURI";
    /// A cluster-scoped model did not name the claim namespace
    pub const NAMESPACE_REQUIRED: &str = "NamespaceRequired";
    /// The claim lives outside the model namespace
    pub const CROSS_NAMESPACE_ACCESS_DENIED: &str = "CrossNamespaceAccessDenied";
    /// The claim does not exist
    pub const PVC_NOT_FOUND: &str = "PVCNotFound";
    /// The claim could not be read
    pub const PVC_ACCESS_FAILED: &str = "PVCAccessFailed";
    /// The claim is not Bound
    pub const PVC_NOT_BOUND: &str = "PVCNotBound";
    /// The claim has no usable access mode
    pub const INCOMPATIBLE_ACCESS_MODES: &str = "IncompatibleAccessModes";
}

/// Which check rejected the claim
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PvcCheck {
    /// URI parsing
    Uri,
    /// Namespace present for cluster-scoped models
    NamespaceRequired,
    /// Namespace boundary
    CrossNamespace,
    /// Claim existence
    NotFound,
    /// API access
    AccessFailed,
    /// Claim phase
    NotBound,
    /// Access modes
    AccessModes,
}

impl PvcCheck {
    /// Reason written to the PVCValidated condition
    pub fn condition_reason(&self) -> &'static str {
        match self {
            PvcCheck::Uri => condition_reasons::INVALID_URI,
            PvcCheck::NamespaceRequired => condition_reasons::NAMESPACE_REQUIRED,
            PvcCheck::CrossNamespace => condition_reasons::CROSS_NAMESPACE_ACCESS_DENIED,
            PvcCheck::NotFound => condition_reasons::PVC_NOT_FOUND,
            PvcCheck::AccessFailed => condition_reasons::PVC_ACCESS_FAILED,
            PvcCheck::NotBound => condition_reasons::PVC_NOT_BOUND,
            PvcCheck::AccessModes => condition_reasons::INCOMPATIBLE_ACCESS_MODES,
        }
    }

    /// Reason of the Warning event emitted for this rejection
    pub fn event_reason(&self) -> &'static str {
        match self {
            PvcCheck::Uri => reasons::INVALID_PVC_URI,
            PvcCheck::NamespaceRequired => reasons::NAMESPACE_REQUIRED,
            PvcCheck::CrossNamespace => reasons::SECURITY_VIOLATION,
            PvcCheck::NotFound => reasons::PVC_NOT_FOUND,
            PvcCheck::AccessFailed => reasons::PVC_ACCESS_FAILED,
            PvcCheck::NotBound => reasons::PVC_NOT_BOUND,
            PvcCheck::AccessModes => reasons::INCOMPATIBLE_ACCESS_MODES,
        }
    }
}

/// A claim that failed validation
#[derive(Debug)]
pub struct PvcRejection {
    /// The failed check
    pub check: PvcCheck,
    /// Short message for the condition
    pub condition_message: String,
    /// Message for the Warning event
    pub event_message: String,
    /// Typed error to return from the reconcile
    pub error: Error,
}

impl PvcRejection {
    /// The PVCValidated=False condition for this rejection
    pub fn condition(&self) -> Condition {
        Condition::new(
            PVC_VALIDATED_CONDITION,
            ConditionStatus::False,
            self.check.condition_reason(),
            self.condition_message.clone(),
        )
    }
}

/// A claim that passed every check
#[derive(Clone, Debug)]
pub struct ValidatedPvc {
    /// Parsed URI
    pub storage: PvcStorage,
    /// Namespace the claim lives in
    pub namespace: String,
    /// The claim as read from the API
    pub claim: PersistentVolumeClaim,
}

impl ValidatedPvc {
    /// Claim name
    pub fn name(&self) -> &str {
        &self.storage.pvc_name
    }

    /// The PVCValidated=True condition
    pub fn condition(&self) -> Condition {
        Condition::new(
            PVC_VALIDATED_CONDITION,
            ConditionStatus::True,
            condition_reasons::VALIDATION_SUCCEEDED,
            format!("PVC '{}' validated successfully", self.name()),
        )
    }
}

/// PVCSecurityValidated condition for a validation outcome.
///
/// `None` when validation stopped before the namespace boundary was checked.
pub fn security_condition(outcome: &Result<ValidatedPvc, PvcRejection>) -> Option<Condition> {
    match outcome {
        Err(r) if r.check == PvcCheck::CrossNamespace => Some(Condition::new(
            PVC_SECURITY_VALIDATED_CONDITION,
            ConditionStatus::False,
            condition_reasons::CROSS_NAMESPACE_ACCESS_DENIED,
            r.condition_message.clone(),
        )),
        Err(r) if matches!(r.check, PvcCheck::Uri | PvcCheck::NamespaceRequired) => None,
        _ => Some(Condition::new(
            PVC_SECURITY_VALIDATED_CONDITION,
            ConditionStatus::True,
            condition_reasons::VALIDATION_SUCCEEDED,
            "PVC is within the allowed namespace",
        )),
    }
}

/// Remediation hint for a claim stuck in `phase`
pub fn not_bound_hint(phase: &str) -> &'static str {
    match phase {
        "Pending" => "PVC is pending. Check if suitable PersistentVolumes are available or if StorageClass can provision new volumes.",
        "Lost" => "PVC is lost. The associated PersistentVolume may have been deleted. Recreate the PVC.",
        _ => "Check PVC status and ensure cluster has available storage resources.",
    }
}

/// Resolve and validate the claim behind `storage_uri`.
///
/// `model_namespace` is the namespace of a BaseModel and `None` for a
/// ClusterBaseModel, which must name the claim namespace in the URI.
pub async fn validate_pvc(
    kube: &dyn ModelKubeClient,
    model_name: &str,
    model_namespace: Option<&str>,
    storage_uri: &str,
) -> Result<ValidatedPvc, PvcRejection> {
    let storage = parse_pvc(storage_uri).map_err(|e| PvcRejection {
        check: PvcCheck::Uri,
        condition_message: format!("Invalid PVC URI format '{storage_uri}'"),
        event_message: format!("Invalid PVC storage URI: {e}"),
        error: Error::validation_for(
            model_name,
            format!("Invalid PVC URI format '{storage_uri}': {e}"),
        )
        .with_remediation("Use format: pvc://namespace:pvc-name/subpath"),
    })?;

    let namespace = resolve_namespace(model_name, model_namespace, &storage)?;
    let pvc_name = storage.pvc_name.clone();

    let claim = match kube.get_pvc(&namespace, &pvc_name).await {
        Ok(Some(claim)) => claim,
        Ok(None) => {
            return Err(PvcRejection {
                check: PvcCheck::NotFound,
                condition_message: format!(
                    "PVC '{pvc_name}' not found in namespace '{namespace}'"
                ),
                event_message: format!("PVC '{pvc_name}' not found in namespace '{namespace}'"),
                error: Error::validation_for(
                    model_name,
                    format!("PVC '{pvc_name}' not found in namespace '{namespace}'"),
                )
                .with_remediation(
                    "Create the PVC or verify the correct PVC name and namespace.",
                ),
            })
        }
        Err(e) => {
            warn!(pvc = %pvc_name, namespace = %namespace, error = %e, "PVC access failed");
            return Err(PvcRejection {
                check: PvcCheck::AccessFailed,
                condition_message: format!("Failed to access PVC '{pvc_name}': {e}"),
                event_message: format!(
                    "Failed to access PVC '{pvc_name}' in namespace '{namespace}'"
                ),
                error: Error::transient_for(
                    model_name,
                    format!("Failed to access PVC '{pvc_name}' in namespace '{namespace}': {e}"),
                )
                .with_remediation("Check RBAC permissions and cluster connectivity."),
            });
        }
    };

    let status = claim.status.clone().unwrap_or_default();
    let phase = status.phase.clone().unwrap_or_default();
    if phase != "Bound" {
        let hint = not_bound_hint(&phase);
        return Err(PvcRejection {
            check: PvcCheck::NotBound,
            condition_message: format!("PVC '{pvc_name}' is not bound (phase: {phase})"),
            event_message: format!(
                "PVC '{pvc_name}' in namespace '{namespace}' is not bound (current phase: {phase})"
            ),
            error: Error::validation_for(
                model_name,
                format!(
                    "PVC '{pvc_name}' in namespace '{namespace}' is not bound (current phase: {phase})"
                ),
            )
            .with_remediation(hint),
        });
    }

    let modes = status.access_modes.unwrap_or_default();
    if !modes
        .iter()
        .any(|m| COMPATIBLE_ACCESS_MODES.contains(&m.as_str()))
    {
        return Err(PvcRejection {
            check: PvcCheck::AccessModes,
            condition_message: format!("PVC '{pvc_name}' has incompatible access modes"),
            event_message: format!("PVC '{pvc_name}' has incompatible access modes: {modes:?}"),
            error: Error::validation_for(
                model_name,
                format!("PVC '{pvc_name}' has incompatible access modes {modes:?}"),
            )
            .with_remediation(
                "Ensure PVC has ReadWriteOnce, ReadOnlyMany, or ReadWriteMany access mode.",
            ),
        });
    }

    debug!(pvc = %pvc_name, namespace = %namespace, "PVC validation successful");
    Ok(ValidatedPvc {
        storage,
        namespace,
        claim,
    })
}

fn resolve_namespace(
    model_name: &str,
    model_namespace: Option<&str>,
    storage: &PvcStorage,
) -> Result<String, PvcRejection> {
    match (model_namespace, storage.namespace.as_deref()) {
        (Some(model_ns), Some(pvc_ns)) if model_ns != pvc_ns => Err(PvcRejection {
            check: PvcCheck::CrossNamespace,
            condition_message: format!(
                "Cross-namespace access denied. PVC must be in the same namespace '{model_ns}'"
            ),
            event_message: format!(
                "Security violation: BaseModel in namespace '{model_ns}' attempted to access PVC '{}' in namespace '{pvc_ns}'",
                storage.pvc_name
            ),
            error: Error::security_for(
                model_name,
                format!(
                    "Cross-namespace PVC access denied. BaseModel in namespace '{model_ns}' cannot access PVC in namespace '{pvc_ns}'"
                ),
            )
            .with_remediation(format!(
                "Move the PVC to namespace '{model_ns}' or create a new PVC in the correct namespace."
            )),
        }),
        (Some(model_ns), _) => Ok(model_ns.to_string()),
        (None, Some(pvc_ns)) => Ok(pvc_ns.to_string()),
        (None, None) => Err(PvcRejection {
            check: PvcCheck::NamespaceRequired,
            condition_message: "PVC URI must include a namespace for ClusterBaseModel".to_string(),
            event_message: format!(
                "ClusterBaseModel PVC URI must specify a namespace: pvc://namespace:{}",
                storage.pvc_name
            ),
            error: Error::validation_for(
                model_name,
                "ClusterBaseModel requires a namespace in the PVC URI",
            )
            .with_remediation("Use format: pvc://namespace:pvc-name/subpath"),
        }),
    }
}
