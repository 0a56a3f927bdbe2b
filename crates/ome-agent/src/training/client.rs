//! HTTP client for the training server running next to the agent

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use ome_common::{Error, Result};

const SERVER: &str = "training-server";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Raw answer of the training server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

impl ServerResponse {
    /// Whether the server answered 200
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Body as text, for logs and error messages
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the `{status, message}` envelope
    pub fn envelope(&self) -> Result<StatusEnvelope> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// `{"status": "...", "message": "..."}` returned by `/status` and by errors
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct StatusEnvelope {
    /// Server-specific state tag
    #[serde(default)]
    pub status: String,
    /// Free text detail
    #[serde(default)]
    pub message: String,
}

/// HTTP verb `/terminate` expects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminateMethod {
    /// Cohere servers
    Get,
    /// PEFT servers
    Post,
}

/// Calls against the training server.
///
/// Failing to reach the server is a transient error; any HTTP answer,
/// whatever its status, is returned as a [`ServerResponse`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FineTuneClient: Send + Sync {
    /// `POST /finetune`
    async fn post_finetune(&self, body: &serde_json::Value) -> Result<ServerResponse>;

    /// `GET /status`
    async fn get_status(&self) -> Result<ServerResponse>;

    /// `GET /metrics`
    async fn get_metrics(&self) -> Result<ServerResponse>;

    /// `GET` or `POST /terminate`
    async fn terminate(&self, method: TerminateMethod) -> Result<ServerResponse>;
}

/// reqwest-backed [`FineTuneClient`]
pub struct HttpFineTuneClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpFineTuneClient {
    /// Client for the server at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context(SERVER, e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, path: &str) -> Result<ServerResponse> {
        let response = request.send().await.map_err(|e| request_error(path, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(path, e))?
            .to_vec();
        debug!(path, status, "training server answered");
        Ok(ServerResponse { status, body })
    }
}

fn request_error(path: &str, e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        Error::transient_for(SERVER, format!("{path}: {e}"))
    } else {
        Error::internal_with_context(SERVER, format!("{path}: {e}"))
    }
}

#[async_trait]
impl FineTuneClient for HttpFineTuneClient {
    async fn post_finetune(&self, body: &serde_json::Value) -> Result<ServerResponse> {
        self.send(self.http.post(self.url("/finetune")).json(body), "/finetune")
            .await
    }

    async fn get_status(&self) -> Result<ServerResponse> {
        self.send(self.http.get(self.url("/status")), "/status").await
    }

    async fn get_metrics(&self) -> Result<ServerResponse> {
        self.send(self.http.get(self.url("/metrics")), "/metrics").await
    }

    async fn terminate(&self, method: TerminateMethod) -> Result<ServerResponse> {
        let url = self.url("/terminate");
        let request = match method {
            TerminateMethod::Get => self.http.get(url),
            TerminateMethod::Post => self.http.post(url),
        };
        self.send(request, "/terminate").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_decoding() {
        let response = ServerResponse {
            status: 422,
            body: br#"{"status":"error","message":"Data error: malformed jsonl"}"#.to_vec(),
        };
        let envelope = response.envelope().unwrap();
        assert_eq!(envelope.status, "error");
        assert_eq!(envelope.message, "Data error: malformed jsonl");
        assert!(!response.is_ok());

        let partial = ServerResponse {
            status: 200,
            body: br#"{"status":"RUNNING"}"#.to_vec(),
        };
        assert_eq!(partial.envelope().unwrap().message, "");
    }

    #[test]
    fn test_base_url_normalized() {
        let client = HttpFineTuneClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.url("/status"), "http://localhost:8000/status");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let client = HttpFineTuneClient::new("http://127.0.0.1:1").unwrap();
        let err = client.get_status().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
