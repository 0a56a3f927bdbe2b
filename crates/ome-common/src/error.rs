//! Error types for the OME control plane
//!
//! Every error carries a kind (see [`ErrorKind`]) that drives how a
//! reconciler reacts: which condition it sets, which event it emits and
//! whether the scheduler should back off and retry. Only transient errors
//! consume retries.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Classification that determines requeue and reporting behavior
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input or wrong phase. Permanent until the user fixes it.
    Validation,
    /// Cross-namespace access or denied permission. Permanent.
    Security,
    /// API timeouts, dial errors, claim-access failures. Retried with backoff.
    Transient,
    /// The training server rejected the dataset. Terminates the agent.
    FatalData,
    /// Bug or unexpected state inside the operator
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "Validation",
            ErrorKind::Security => "Security",
            ErrorKind::Transient => "Transient",
            ErrorKind::FatalData => "FatalData",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// Main error type for OME operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid user input (malformed URI, missing field, wrong phase)
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource the error is about
        resource: String,
        /// Description of what's invalid
        message: String,
        /// Hint telling the user how to fix it
        remediation: Option<String>,
    },

    /// Access outside the allowed scope
    #[error("security error for {resource}: {message}")]
    Security {
        /// Resource the error is about
        resource: String,
        /// Description of the violation
        message: String,
        /// Hint telling the user how to fix it
        remediation: Option<String>,
    },

    /// A failure that may clear up on its own
    #[error("transient error for {resource}: {message}")]
    Transient {
        /// Resource the error is about
        resource: String,
        /// Description of what failed
        message: String,
        /// Hint telling the user what to check
        remediation: Option<String>,
    },

    /// Training server reported that the dataset is unusable
    #[error("data error: {message}")]
    FatalData {
        /// Concise user-facing message
        message: String,
    },

    /// Object storage, KMS or vault failure
    #[error("storage error: {message}")]
    Storage {
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "agent")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            remediation: None,
        }
    }

    /// Create a validation error scoped to a resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            remediation: None,
        }
    }

    /// Create a security error scoped to a resource
    pub fn security_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Security {
            resource: resource.into(),
            message: msg.into(),
            remediation: None,
        }
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            remediation: None,
        }
    }

    /// Create a transient error scoped to a resource
    pub fn transient_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            resource: resource.into(),
            message: msg.into(),
            remediation: None,
        }
    }

    /// Create a fatal data error
    pub fn fatal_data(msg: impl Into<String>) -> Self {
        Self::FatalData {
            message: msg.into(),
        }
    }

    /// Create a retryable storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a storage error that will not succeed on retry
    pub fn storage_permanent(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach a remediation hint to a validation, security or transient error.
    ///
    /// Other variants are returned unchanged.
    pub fn with_remediation(mut self, hint: impl Into<String>) -> Self {
        match &mut self {
            Error::Validation { remediation, .. }
            | Error::Security { remediation, .. }
            | Error::Transient { remediation, .. } => *remediation = Some(hint.into()),
            _ => {}
        }
        self
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => ErrorKind::Security,
                // Conflicts and throttling clear up once the cache catches up
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => ErrorKind::Transient,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => ErrorKind::Validation,
                _ => ErrorKind::Transient,
            },
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Security { .. } => ErrorKind::Security,
            Error::Transient { .. } => ErrorKind::Transient,
            Error::FatalData { .. } => ErrorKind::FatalData,
            Error::Storage { retryable, .. } => {
                if *retryable {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Validation
                }
            }
            Error::Serialization { .. } => ErrorKind::Validation,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    ///
    /// Only transient errors feed the backoff schedule.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. }
            | Error::Security { resource, .. }
            | Error::Transient { resource, .. } => Some(resource),
            _ => None,
        }
    }

    /// Get the remediation hint if one was attached
    pub fn remediation(&self) -> Option<&str> {
        match self {
            Error::Validation { remediation, .. }
            | Error::Security { remediation, .. }
            | Error::Transient { remediation, .. } => remediation.as_deref(),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Whatever".to_string(),
            code,
        }))
    }

    // ==========================================================================
    // Story Tests: Error Classification During Reconciliation
    // ==========================================================================

    /// Story: A malformed storage URI is reported once and never retried
    #[test]
    fn story_validation_errors_are_permanent() {
        let err = Error::validation_for("default/llama", "unsupported storage URI scheme");
        assert!(err.to_string().contains("validation error for default/llama"));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
        assert_eq!(err.resource(), Some("default/llama"));
    }

    /// Story: Cross-namespace PVC access surfaces as a security error with a fix
    #[test]
    fn story_security_errors_carry_remediation() {
        let err = Error::security_for("ns-a/model", "Cross-namespace PVC access denied")
            .with_remediation("Move the PVC to namespace 'ns-a'");
        assert_eq!(err.kind(), ErrorKind::Security);
        assert!(!err.is_retryable());
        assert_eq!(err.remediation(), Some("Move the PVC to namespace 'ns-a'"));
    }

    /// Story: Only transient errors consume retries
    #[test]
    fn story_only_transient_errors_are_retryable() {
        assert!(Error::transient("connection reset").is_retryable());
        assert!(Error::storage("timeout").is_retryable());
        assert!(!Error::storage_permanent("bucket missing").is_retryable());
        assert!(!Error::fatal_data("bad jsonl").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
        assert!(!Error::internal("bug").is_retryable());
    }

    /// Story: Kubernetes API errors map onto the taxonomy by status code
    #[test]
    fn story_kube_errors_classified_by_status() {
        assert_eq!(api_error(404).kind(), ErrorKind::Validation);
        assert_eq!(api_error(403).kind(), ErrorKind::Security);
        assert_eq!(api_error(409).kind(), ErrorKind::Transient);
        assert_eq!(api_error(500).kind(), ErrorKind::Transient);
    }

    /// Story: Remediation only sticks to user-facing variants
    #[test]
    fn story_remediation_ignored_on_internal_errors() {
        let err = Error::internal_with_context("reconciler", "state drift").with_remediation("x");
        assert_eq!(err.remediation(), None);
        assert_eq!(err.context(), Some("reconciler"));
    }
}
