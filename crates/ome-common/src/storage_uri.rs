//! Storage URI parsing
//!
//! Models and training artifacts are addressed by opaque URIs:
//!
//! - `oci://n/<namespace>/b/<bucket>/o/<object>`: object storage
//! - `pvc://[<namespace>:]<claim>[/<subpath>]`: a PersistentVolumeClaim
//! - `hf://<org>/<model>[@<branch>]`: a HuggingFace Hub repository

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Prefix of object storage URIs
pub const OCI_PREFIX: &str = "oci://";
/// Prefix of PersistentVolumeClaim URIs
pub const PVC_PREFIX: &str = "pvc://";
/// Prefix of HuggingFace Hub URIs
pub const HF_PREFIX: &str = "hf://";

/// Branch used when a HuggingFace URI does not name one
pub const DEFAULT_HF_BRANCH: &str = "main";

static HF_MODEL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]{1,96}/[A-Za-z0-9_.-]{1,96}$")
        .expect("static HuggingFace model id pattern compiles")
});

/// Errors produced while parsing a storage URI
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageUriError {
    /// The URI does not start with a known prefix
    #[error("unsupported storage URI scheme: {0}")]
    UnsupportedScheme(String),

    /// The prefix is known but required segments are missing or malformed
    #[error("invalid {scheme} storage URI format: {reason}")]
    InvalidFormat {
        /// Which URI family was being parsed
        scheme: &'static str,
        /// What was wrong
        reason: String,
    },
}

impl StorageUriError {
    fn invalid(scheme: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            scheme,
            reason: reason.into(),
        }
    }
}

impl From<StorageUriError> for crate::Error {
    fn from(e: StorageUriError) -> Self {
        crate::Error::validation(e.to_string())
    }
}

/// Storage backend family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageType {
    /// Object storage
    Oci,
    /// PersistentVolumeClaim
    Pvc,
    /// HuggingFace Hub
    HuggingFace,
}

/// Components of an `oci://` URI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OciStorage {
    /// Object storage namespace
    pub namespace: String,
    /// Bucket name
    pub bucket: String,
    /// Object name or prefix; may contain `/`
    pub prefix: String,
}

impl fmt::Display for OciStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{OCI_PREFIX}n/{}/b/{}/o/{}",
            self.namespace, self.bucket, self.prefix
        )
    }
}

/// Components of a `pvc://` URI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PvcStorage {
    /// Namespace of the claim when given explicitly
    pub namespace: Option<String>,
    /// Claim name
    pub pvc_name: String,
    /// Path inside the volume
    pub sub_path: Option<String>,
}

/// Components of an `hf://` URI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HuggingFaceStorage {
    /// `<org>/<model>` repository id
    pub model_id: String,
    /// Git revision, `main` unless given
    pub branch: String,
}

/// A parsed storage URI
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageUri {
    /// `oci://n/<namespace>/b/<bucket>/o/<object>`
    Oci(OciStorage),
    /// `pvc://[<namespace>:]<claim>[/<subpath>]`
    Pvc(PvcStorage),
    /// `hf://<org>/<model>[@<branch>]`
    HuggingFace(HuggingFaceStorage),
}

impl StorageUri {
    /// Parse any supported storage URI
    pub fn parse(uri: &str) -> Result<Self, StorageUriError> {
        match storage_type(uri)? {
            StorageType::Oci => parse_oci(uri).map(StorageUri::Oci),
            StorageType::Pvc => parse_pvc(uri).map(StorageUri::Pvc),
            StorageType::HuggingFace => parse_hf(uri).map(StorageUri::HuggingFace),
        }
    }

    /// Backend family of this URI
    pub fn storage_type(&self) -> StorageType {
        match self {
            StorageUri::Oci(_) => StorageType::Oci,
            StorageUri::Pvc(_) => StorageType::Pvc,
            StorageUri::HuggingFace(_) => StorageType::HuggingFace,
        }
    }
}

/// Determine the backend family from the URI prefix
pub fn storage_type(uri: &str) -> Result<StorageType, StorageUriError> {
    if uri.starts_with(OCI_PREFIX) {
        Ok(StorageType::Oci)
    } else if uri.starts_with(PVC_PREFIX) {
        Ok(StorageType::Pvc)
    } else if uri.starts_with(HF_PREFIX) {
        Ok(StorageType::HuggingFace)
    } else {
        Err(StorageUriError::UnsupportedScheme(uri.to_string()))
    }
}

/// Parse `oci://n/<namespace>/b/<bucket>/o/<object>`
pub fn parse_oci(uri: &str) -> Result<OciStorage, StorageUriError> {
    let rest = uri
        .strip_prefix(OCI_PREFIX)
        .ok_or_else(|| StorageUriError::invalid("OCI", format!("missing {OCI_PREFIX} prefix")))?;

    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() < 6 || parts[0] != "n" || parts[2] != "b" || parts[4] != "o" {
        return Err(StorageUriError::invalid(
            "OCI",
            "expected oci://n/{namespace}/b/{bucket}/o/{object_path}",
        ));
    }
    if parts[1].is_empty() || parts[3].is_empty() {
        return Err(StorageUriError::invalid(
            "OCI",
            "namespace and bucket cannot be empty",
        ));
    }

    Ok(OciStorage {
        namespace: parts[1].to_string(),
        bucket: parts[3].to_string(),
        prefix: parts[5..].join("/"),
    })
}

/// Parse `pvc://[<namespace>:]<claim>[/<subpath>]`
pub fn parse_pvc(uri: &str) -> Result<PvcStorage, StorageUriError> {
    let rest = uri
        .strip_prefix(PVC_PREFIX)
        .ok_or_else(|| StorageUriError::invalid("PVC", format!("missing {PVC_PREFIX} prefix")))?;
    if rest.is_empty() {
        return Err(StorageUriError::invalid(
            "PVC",
            "missing content after prefix",
        ));
    }

    let (claim_part, sub_path) = match rest.split_once('/') {
        Some((head, tail)) => (head, (!tail.is_empty()).then(|| tail.to_string())),
        None => (rest, None),
    };

    let (namespace, pvc_name) = match claim_part.split_once(':') {
        Some((ns, name)) => {
            if ns.is_empty() {
                return Err(StorageUriError::invalid(
                    "PVC",
                    "empty namespace before colon",
                ));
            }
            if name.is_empty() {
                return Err(StorageUriError::invalid(
                    "PVC",
                    "empty PVC name after colon",
                ));
            }
            if name.contains(':') {
                return Err(StorageUriError::invalid(
                    "PVC",
                    "multiple colons not allowed in namespace:pvc-name",
                ));
            }
            if !is_valid_namespace(ns) {
                return Err(StorageUriError::invalid(
                    "PVC",
                    format!(
                        "invalid namespace {ns:?} (must be lowercase alphanumeric with hyphens, max 63 chars)"
                    ),
                ));
            }
            (Some(ns.to_string()), name.to_string())
        }
        None => {
            if claim_part.is_empty() {
                return Err(StorageUriError::invalid("PVC", "missing PVC name"));
            }
            (None, claim_part.to_string())
        }
    };

    Ok(PvcStorage {
        namespace,
        pvc_name,
        sub_path,
    })
}

/// Parse `hf://<org>/<model>[@<branch>]`
pub fn parse_hf(uri: &str) -> Result<HuggingFaceStorage, StorageUriError> {
    let rest = uri.strip_prefix(HF_PREFIX).ok_or_else(|| {
        StorageUriError::invalid("HuggingFace", format!("missing {HF_PREFIX} prefix"))
    })?;

    let (model_id, branch) = match rest.split_once('@') {
        Some((id, branch)) if !branch.is_empty() => (id, branch),
        Some((id, _)) => (id, DEFAULT_HF_BRANCH),
        None => (rest, DEFAULT_HF_BRANCH),
    };

    if model_id.is_empty() {
        return Err(StorageUriError::invalid(
            "HuggingFace",
            "model ID cannot be empty",
        ));
    }
    if !is_valid_hf_model_id(model_id) {
        return Err(StorageUriError::invalid(
            "HuggingFace",
            format!("model ID {model_id:?} must match <organization>/<model>"),
        ));
    }

    Ok(HuggingFaceStorage {
        model_id: model_id.to_string(),
        branch: branch.to_string(),
    })
}

/// Whether `id` is a well-formed `<org>/<model>` HuggingFace repository id
pub fn is_valid_hf_model_id(id: &str) -> bool {
    HF_MODEL_ID.is_match(id)
}

fn is_valid_namespace(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_oci_keeps_slashes_in_object() {
        let oci = parse_oci("oci://n/tenancy/b/models/o/llama/3/8b").unwrap();
        assert_eq!(oci.namespace, "tenancy");
        assert_eq!(oci.bucket, "models");
        assert_eq!(oci.prefix, "llama/3/8b");
        assert_eq!(oci.to_string(), "oci://n/tenancy/b/models/o/llama/3/8b");
    }

    #[test]
    fn test_parse_oci_missing_segments() {
        let err = parse_oci("oci://n/tenancy/b/models").unwrap_err();
        assert!(matches!(err, StorageUriError::InvalidFormat { .. }));
        assert!(parse_oci("oci://x/tenancy/b/models/o/obj").is_err());
    }

    #[test]
    fn test_parse_pvc_variants() {
        let full = parse_pvc("pvc://team-a:weights/llama/8b").unwrap();
        assert_eq!(full.namespace.as_deref(), Some("team-a"));
        assert_eq!(full.pvc_name, "weights");
        assert_eq!(full.sub_path.as_deref(), Some("llama/8b"));

        let bare = parse_pvc("pvc://weights").unwrap();
        assert_eq!(bare.namespace, None);
        assert_eq!(bare.sub_path, None);
    }

    #[test]
    fn test_parse_pvc_rejects_bad_namespace() {
        assert!(parse_pvc("pvc://Team_A:weights/x").is_err());
        assert!(parse_pvc("pvc://:weights/x").is_err());
        assert!(parse_pvc("pvc://ns:/x").is_err());
        assert!(parse_pvc("pvc://ns:a:b/x").is_err());
        assert!(parse_pvc("pvc://").is_err());
    }

    #[test]
    fn test_parse_hf_default_branch() {
        let hf = parse_hf("hf://mistralai/Mistral-7B").unwrap();
        assert_eq!(hf.model_id, "mistralai/Mistral-7B");
        assert_eq!(hf.branch, "main");

        let pinned = parse_hf("hf://meta-llama/Llama-3.1-8B@v2").unwrap();
        assert_eq!(pinned.branch, "v2");
    }

    /// Story: repository ids are bounded at 96 characters per segment
    #[test]
    fn story_hf_segment_length_boundary() {
        let ok = format!("{}/{}", "a".repeat(96), "b".repeat(96));
        assert!(is_valid_hf_model_id(&ok));

        let too_long = format!("{}/{}", "a".repeat(97), "b");
        assert!(!is_valid_hf_model_id(&too_long));
        assert!(parse_hf(&format!("hf://{too_long}")).is_err());
    }

    #[test]
    fn test_unknown_scheme() {
        assert_eq!(
            StorageUri::parse("s3://bucket/key"),
            Err(StorageUriError::UnsupportedScheme("s3://bucket/key".into()))
        );
        assert_eq!(
            StorageUri::parse("hf://org/model").unwrap().storage_type(),
            StorageType::HuggingFace
        );
    }
}
