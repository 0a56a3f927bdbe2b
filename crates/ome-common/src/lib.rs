//! Common types for OME: CRDs, errors, storage URIs, and shared utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod model_entry;
pub mod object_store;
pub mod retry;
pub mod storage_uri;
pub mod telemetry;

pub use error::{Error, ErrorKind};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all OME resources
pub const OME_API_GROUP: &str = "ome.io";

/// API version for all OME resources
pub const OME_API_VERSION: &str = "ome.io/v1beta1";

/// Namespace the operator runs in when `POD_NAMESPACE` is not set
pub const DEFAULT_OME_NAMESPACE: &str = "ome";

/// Label key marking per-node model status ConfigMaps
pub const MODEL_STATUS_LABEL_KEY: &str = "ome.io/model-status";

/// Label selector for per-node model status ConfigMaps (for Kubernetes API queries)
pub const MODEL_STATUS_LABEL_SELECTOR: &str = "ome.io/model-status=true";

/// ConfigMap holding operator-wide configuration blobs
pub const INFERENCESERVICE_CONFIG_MAP_NAME: &str = "inferenceservice-config";

/// Annotation carrying the size category (SMALL or LARGE) of a base model
pub const MODEL_CATEGORY_ANNOTATION: &str = "models.ome.io/category";

/// Annotation naming the KMS key used to decrypt a base model
pub const BASE_MODEL_DECRYPTION_KEY_NAME: &str = "ome.io/base-model-decryption-key-name";

/// Annotation naming the vault secret holding the wrapped data key of a base model
pub const BASE_MODEL_DECRYPTION_SECRET_NAME: &str = "ome.io/base-model-decryption-secret-name";

/// Label key describing what a base model is used for (serving or fine-tuning)
pub const BASE_MODEL_TYPE_LABEL_KEY: &str = "base-model-type";

/// Suffix appended to the object name of merged fine-tuned weights
pub const MERGED_WEIGHT_SUFFIX: &str = "-merged-weight";

/// Resolve the namespace the operator is deployed in.
///
/// Reads `POD_NAMESPACE` (set via the downward API) and falls back to
/// [`DEFAULT_OME_NAMESPACE`].
pub fn ome_namespace() -> String {
    std::env::var("POD_NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_OME_NAMESPACE.to_string())
}
