//! HuggingFace Hub validation
//!
//! Probes the Hub API with a HEAD request to learn whether a model exists.
//! Anything short of a definite answer (rate limits, server errors, timeouts,
//! network failures) fails open: the model is treated as valid and a warning
//! is recorded instead.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use ome_common::crd::StorageValidationStatus;
use ome_common::storage_uri::{is_valid_hf_model_id, parse_hf};
use ome_common::Error;

/// Public Hub endpoint
pub const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";

/// Path of the model metadata API
pub const HF_API_PATH: &str = "api/models";

/// Deadline of one validation request
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A successful check is not repeated within this interval
pub const VALIDATION_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Secret key holding the Hub token unless `parameters.secretKey` overrides it
pub const DEFAULT_SECRET_TOKEN_KEY: &str = "token";

/// Message recorded when the model is reachable
pub const VALIDATION_SUCCESS_MESSAGE: &str = "HuggingFace model exists and is accessible";

const MAX_IDLE_CONNECTIONS: usize = 10;

/// Outcome of probing the registry for one model
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryValidation {
    /// Whether the model may be used
    pub valid: bool,
    /// Whether the registry confirmed the model exists
    pub exists: bool,
    /// Whether the registry asked for credentials
    pub requires_auth: bool,
    /// Definite failure
    pub error_message: Option<String>,
    /// Fail-open or credential hint
    pub warning_message: Option<String>,
}

impl RegistryValidation {
    fn accessible() -> Self {
        Self {
            valid: true,
            exists: true,
            ..Default::default()
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    fn fail_open(warning: impl Into<String>) -> Self {
        Self {
            warning_message: Some(warning.into()),
            ..Self::accessible()
        }
    }

    /// Message to surface: error first, then warning, then success
    pub fn message(&self) -> Option<String> {
        self.error_message
            .clone()
            .or_else(|| self.warning_message.clone())
            .or_else(|| self.valid.then(|| VALIDATION_SUCCESS_MESSAGE.to_string()))
    }

    /// Status record of this outcome, stamped with `now`
    pub fn to_status(&self, now: DateTime<Utc>) -> StorageValidationStatus {
        StorageValidationStatus {
            last_checked: Some(now),
            valid: self.valid,
            message: self.message(),
        }
    }
}

/// Checks whether a model id is known to an external registry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Probe the registry for `model_id`, authenticating with `token` if given
    async fn validate(&self, model_id: &str, token: Option<String>) -> RegistryValidation;
}

/// HuggingFace Hub client
pub struct HuggingFaceRegistry {
    client: reqwest::Client,
    endpoint: String,
}

impl HuggingFaceRegistry {
    /// Client for the public Hub
    pub fn new() -> Result<Self, Error> {
        Self::with_endpoint(DEFAULT_HF_ENDPOINT, VALIDATION_TIMEOUT)
    }

    /// Client for a Hub mirror at `endpoint`
    pub fn with_endpoint(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| {
                Error::internal_with_context("registry", format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ModelRegistry for HuggingFaceRegistry {
    async fn validate(&self, model_id: &str, token: Option<String>) -> RegistryValidation {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return RegistryValidation::invalid("model ID cannot be empty");
        }
        if !is_valid_hf_model_id(model_id) {
            return RegistryValidation::invalid(format!(
                "invalid model ID format {model_id:?}: expected format <organization>/<model>"
            ));
        }

        let url = format!("{}/{HF_API_PATH}/{model_id}", self.endpoint);
        let token = token.filter(|t| !t.is_empty());
        let mut request = self.client.head(&url);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return RegistryValidation::fail_open(
                    "HuggingFace model validation timed out, proceeding without validation",
                )
            }
            Err(e) => {
                return RegistryValidation::fail_open(format!(
                    "HuggingFace API unavailable ({e}), proceeding without validation"
                ))
            }
        };

        let status = response.status();
        // Drain so the pooled connection can be reused
        let _ = response.bytes().await;
        debug!(model = %model_id, status = %status, "HuggingFace API responded");

        classify_status(model_id, status, token.is_some())
    }
}

fn classify_status(model_id: &str, status: StatusCode, has_token: bool) -> RegistryValidation {
    match status {
        StatusCode::OK => RegistryValidation::accessible(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RegistryValidation {
            requires_auth: true,
            warning_message: (!has_token).then(|| {
                format!(
                    "HuggingFace model {model_id:?} may require authentication; consider providing a token via storageKey if access fails during download"
                )
            }),
            ..RegistryValidation::accessible()
        },
        StatusCode::NOT_FOUND => RegistryValidation::invalid(format!(
            "HuggingFace model {model_id:?} does not exist. Please verify the model ID in your storageUri"
        )),
        StatusCode::TOO_MANY_REQUESTS => RegistryValidation::fail_open(
            "HuggingFace API rate limited, proceeding without validation",
        ),
        s if s.is_server_error() => RegistryValidation::fail_open(format!(
            "HuggingFace API returned server error (status {}), proceeding without validation",
            s.as_u16()
        )),
        s => RegistryValidation::fail_open(format!(
            "HuggingFace API returned unexpected status {}, proceeding without validation",
            s.as_u16()
        )),
    }
}

/// Whether the last check is recent enough to skip probing again
pub fn recently_checked(current: Option<&StorageValidationStatus>, now: DateTime<Utc>) -> bool {
    let Some(last) = current.and_then(|s| s.last_checked) else {
        return false;
    };
    now.signed_duration_since(last)
        .to_std()
        .map(|elapsed| elapsed < VALIDATION_CHECK_INTERVAL)
        // A timestamp in the future counts as recent
        .unwrap_or(true)
}

/// Validate an `hf://` storage URI against the registry.
///
/// Returns the status to persist, or the current status untouched when it
/// was refreshed within [`VALIDATION_CHECK_INTERVAL`].
pub async fn validate_storage_uri(
    registry: &dyn ModelRegistry,
    storage_uri: &str,
    token: Option<String>,
    current: Option<&StorageValidationStatus>,
    now: DateTime<Utc>,
) -> StorageValidationStatus {
    if recently_checked(current, now) {
        if let Some(current) = current {
            debug!(storage_uri, "skipping HuggingFace validation, recently checked");
            return current.clone();
        }
    }

    info!(storage_uri, "validating HuggingFace storage URI");
    let result = match parse_hf(storage_uri) {
        Ok(hf) => registry.validate(&hf.model_id, token).await,
        Err(e) => RegistryValidation::invalid(format!("invalid HuggingFace storage URI: {e}")),
    };
    result.to_status(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve every connection with a bodiless response of `status`
    async fn stub_hub(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    async fn probe(status: u16, token: Option<&str>) -> RegistryValidation {
        let endpoint = stub_hub(status).await;
        let registry = HuggingFaceRegistry::with_endpoint(endpoint, VALIDATION_TIMEOUT).unwrap();
        registry
            .validate("mistralai/Mistral-7B", token.map(str::to_string))
            .await
    }

    /// Story: a public model that exists validates with the success message
    #[tokio::test]
    async fn story_existing_model_is_accessible() {
        let result = probe(200, None).await;
        assert!(result.valid && result.exists);
        assert_eq!(
            result.message().as_deref(),
            Some("HuggingFace model exists and is accessible")
        );
    }

    /// Story: gated models are valid but hint at credentials when none were given
    #[tokio::test]
    async fn story_gated_model_warns_without_token() {
        let result = probe(401, None).await;
        assert!(result.valid && result.requires_auth);
        assert!(result
            .warning_message
            .unwrap()
            .contains("may require authentication"));

        let with_token = probe(403, Some("hf_abc")).await;
        assert!(with_token.requires_auth);
        assert!(with_token.warning_message.is_none());
        assert_eq!(
            with_token.message().as_deref(),
            Some(VALIDATION_SUCCESS_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_missing_model_is_invalid() {
        let result = probe(404, None).await;
        assert!(!result.valid && !result.exists);
        assert_eq!(
            result.error_message.as_deref(),
            Some("HuggingFace model \"mistralai/Mistral-7B\" does not exist. Please verify the model ID in your storageUri")
        );
    }

    /// Story: rate limiting and server errors fail open with a warning
    #[tokio::test]
    async fn story_registry_trouble_fails_open() {
        let limited = probe(429, None).await;
        assert!(limited.valid);
        assert_eq!(
            limited.message().as_deref(),
            Some("HuggingFace API rate limited, proceeding without validation")
        );

        let broken = probe(503, None).await;
        assert!(broken.valid);
        assert_eq!(
            broken.warning_message.as_deref(),
            Some("HuggingFace API returned server error (status 503), proceeding without validation")
        );

        let odd = probe(418, None).await;
        assert!(odd.valid);
        assert!(odd.warning_message.unwrap().contains("unexpected status 418"));
    }

    #[tokio::test]
    async fn test_unreachable_registry_fails_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry =
            HuggingFaceRegistry::with_endpoint(format!("http://{addr}"), VALIDATION_TIMEOUT)
                .unwrap();
        let result = registry.validate("org/model", None).await;
        assert!(result.valid);
        assert!(result
            .warning_message
            .unwrap()
            .starts_with("HuggingFace API unavailable"));
    }

    #[tokio::test]
    async fn test_slow_registry_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let registry = HuggingFaceRegistry::with_endpoint(
            format!("http://{addr}"),
            Duration::from_millis(200),
        )
        .unwrap();
        let result = registry.validate("org/model", None).await;
        assert!(result.valid);
        assert_eq!(
            result.warning_message.as_deref(),
            Some("HuggingFace model validation timed out, proceeding without validation")
        );
    }

    #[tokio::test]
    async fn test_malformed_ids_rejected_without_network() {
        let registry =
            HuggingFaceRegistry::with_endpoint("http://127.0.0.1:9", VALIDATION_TIMEOUT).unwrap();

        let empty = registry.validate("  ", None).await;
        assert_eq!(empty.error_message.as_deref(), Some("model ID cannot be empty"));

        let bad = registry.validate("no-slash", None).await;
        assert_eq!(
            bad.error_message.as_deref(),
            Some("invalid model ID format \"no-slash\": expected format <organization>/<model>")
        );
        assert!(!bad.valid);
    }

    /// Story: a check within the last day is not repeated
    #[tokio::test]
    async fn story_recent_check_is_reused() {
        let now = Utc::now();
        let current = StorageValidationStatus {
            last_checked: Some(now - chrono::Duration::hours(2)),
            valid: true,
            message: Some(VALIDATION_SUCCESS_MESSAGE.to_string()),
        };

        let mut registry = MockModelRegistry::new();
        registry.expect_validate().never();

        let status = validate_storage_uri(
            &registry,
            "hf://mistralai/Mistral-7B",
            None,
            Some(&current),
            now,
        )
        .await;
        assert_eq!(status, current);
    }

    #[tokio::test]
    async fn test_stale_check_is_refreshed() {
        let now = Utc::now();
        let current = StorageValidationStatus {
            last_checked: Some(now - chrono::Duration::hours(25)),
            valid: false,
            message: None,
        };

        let mut registry = MockModelRegistry::new();
        registry
            .expect_validate()
            .withf(|id, token| id == "mistralai/Mistral-7B" && token.as_deref() == Some("hf_x"))
            .times(1)
            .returning(|_, _| RegistryValidation::accessible());

        let status = validate_storage_uri(
            &registry,
            "hf://mistralai/Mistral-7B",
            Some("hf_x".to_string()),
            Some(&current),
            now,
        )
        .await;
        assert!(status.valid);
        assert_eq!(status.last_checked, Some(now));
        assert_eq!(status.message.as_deref(), Some(VALIDATION_SUCCESS_MESSAGE));
    }
}
