//! Training sidecar
//!
//! Runs next to the training server and walks one linear pipeline:
//! download the dataset, kick off training, poll until the server reports
//! a terminal state, zip the output, upload it with the metrics, then shut
//! the server down. Any stage failure ends the run with an error so the pod
//! restart policy takes over.

pub mod client;
pub mod config;
pub mod data_error;
pub mod details;
pub mod packaging;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use ome_common::crd::TrainingRuntimeType;
use ome_common::object_store::{DownloadOptions, ObjectStore, ObjectUri};
use ome_common::{Error, Result};

use client::{FineTuneClient, TerminateMethod};
use config::TrainingConfig;
use data_error::record_data_error;
use details::FineTuneDetails;
use packaging::{require_file, ArtifactPlan};

pub use client::HttpFineTuneClient;

/// Files above this size are transferred in parts
pub const BIG_FILE_SIZE_MB: u64 = 200;
/// Part size for dataset downloads
pub const DOWNLOAD_CHUNK_SIZE_MB: u64 = 20;
/// Part size for weight uploads
pub const UPLOAD_CHUNK_SIZE_MB: u64 = 50;
/// Parallel parts per transfer
pub const TRANSFER_THREADS: usize = 10;

const SERVER: &str = "training-server";

/// Where the server says training is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingProgress {
    /// Still going (or not started yet)
    Running,
    /// Output is ready
    Finished,
    /// Anything the runtime does not list as healthy
    Failed,
}

impl TrainingProgress {
    /// Interpret a `/status` tag for `runtime`
    pub fn from_status(runtime: TrainingRuntimeType, status: &str) -> Self {
        match (runtime, status) {
            (TrainingRuntimeType::Peft, "FINISHED") => Self::Finished,
            (TrainingRuntimeType::Peft, "RUNNING" | "READY") => Self::Running,
            (TrainingRuntimeType::Peft, _) => Self::Failed,
            (_, "finished") => Self::Finished,
            (_, "idle" | "in progress") => Self::Running,
            _ => Self::Failed,
        }
    }
}

/// The sidecar pipeline
pub struct TrainingAgent {
    config: TrainingConfig,
    store: Arc<dyn ObjectStore>,
    server: Arc<dyn FineTuneClient>,
}

impl TrainingAgent {
    /// Validate settings and wire collaborators
    pub fn new(
        config: TrainingConfig,
        store: Arc<dyn ObjectStore>,
        server: Arc<dyn FineTuneClient>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            server,
        })
    }

    /// Run every stage in order
    pub async fn run(&self) -> Result<()> {
        info!(
            runtime = %self.config.runtime,
            training = %self.config.training_name,
            "starting training agent"
        );

        self.download_dataset().await?;
        self.start_training().await?;
        self.wait_for_training().await?;
        let merged = self.package().await?;
        self.upload_weights(merged.as_deref()).await?;
        self.upload_metrics().await?;
        self.terminate().await;

        info!(training = %self.config.training_name, "training agent finished");
        Ok(())
    }

    async fn download_dataset(&self) -> Result<()> {
        let source = self.config.training_data_uri();
        let opts = DownloadOptions::default()
            .size_threshold_mb(BIG_FILE_SIZE_MB)
            .chunk_size_mb(DOWNLOAD_CHUNK_SIZE_MB)
            .threads(TRANSFER_THREADS)
            .use_base_name_only();
        tokio::fs::create_dir_all(&self.config.training_data_directory).await?;

        info!(object = %source, dir = %self.config.training_data_directory.display(), "downloading training data");
        let path = self
            .store
            .smart_download(&source, &self.config.training_data_directory, &opts)
            .await?;
        if let Some(path) = path {
            info!(path = %path.display(), "training data downloaded");
        }
        Ok(())
    }

    async fn start_training(&self) -> Result<()> {
        let body = FineTuneDetails::from_config(&self.config)?.to_json()?;
        info!(url = %self.config.server_url, details = %body, "kicking off training");

        let started = Instant::now();
        let response = loop {
            match self.server.post_finetune(&body).await {
                Ok(response) => break response,
                Err(e) if e.is_retryable() => {
                    if started.elapsed() > self.config.kickoff_timeout() {
                        return Err(Error::transient_for(
                            SERVER,
                            format!(
                                "training server did not come up within {}s: {e}",
                                self.config.kickoff_timeout_secs
                            ),
                        ));
                    }
                    warn!(error = %e, "training server not reachable yet, retrying");
                    tokio::time::sleep(self.config.retry_interval()).await;
                }
                Err(e) => return Err(e),
            }
        };

        if matches!(response.status, 200 | 202) {
            info!(status = response.status, body = %response.text(), "/finetune accepted");
            return Ok(());
        }

        error!(status = response.status, body = %response.text(), "/finetune rejected");
        // PEFT validates the dataset synchronously; cohere reports it through /status
        if self.config.runtime == TrainingRuntimeType::Peft && response.status == 422 {
            if let Ok(envelope) = response.envelope() {
                if let Some(message) =
                    record_data_error(&self.config.termination_log_path, &envelope.message).await
                {
                    return Err(Error::fatal_data(message));
                }
            }
        }
        Err(Error::internal_with_context(
            SERVER,
            format!("/finetune returned {}: {}", response.status, response.text()),
        ))
    }

    async fn wait_for_training(&self) -> Result<()> {
        loop {
            let response = self.server.get_status().await?;
            if !response.is_ok() {
                return Err(Error::internal_with_context(
                    SERVER,
                    format!("/status returned {}: {}", response.status, response.text()),
                ));
            }
            let envelope = response.envelope()?;
            info!(status = %envelope.status, message = %envelope.message, "training status");

            match TrainingProgress::from_status(self.config.runtime, &envelope.status) {
                TrainingProgress::Finished => return Ok(()),
                TrainingProgress::Running => {}
                TrainingProgress::Failed => {
                    let recorded = if self.config.runtime == TrainingRuntimeType::Peft {
                        None
                    } else {
                        record_data_error(&self.config.termination_log_path, &envelope.message)
                            .await
                    };
                    info!("terminating training server");
                    self.terminate().await;
                    return Err(match recorded {
                        Some(message) => Error::fatal_data(message),
                        None => Error::internal_with_context(
                            SERVER,
                            format!(
                                "training failed with status {:?}: {}",
                                envelope.status, envelope.message
                            ),
                        ),
                    });
                }
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn package(&self) -> Result<Option<std::path::PathBuf>> {
        let config = self.config.clone();
        let merged = crate::archive::blocking(move || {
            let plan = ArtifactPlan::for_config(&config)?;
            info!(?plan, dir = %config.model_directory.display(), "packing trained model");
            plan.pack(&config)
        })
        .await?;
        info!(archive = %self.config.zipped_model_path.display(), "trained model packed");
        Ok(merged)
    }

    async fn upload_weights(&self, merged: Option<&Path>) -> Result<()> {
        self.upload_archive(&self.config.zipped_model_path, &self.config.model_uri())
            .await?;
        if let Some(merged) = merged {
            self.upload_archive(merged, &self.config.merged_model_uri())
                .await?;
        }
        Ok(())
    }

    async fn upload_archive(&self, path: &Path, target: &ObjectUri) -> Result<()> {
        require_file(path)?;
        info!(file = %path.display(), object = %target, "uploading archive");
        self.store
            .smart_upload(
                path,
                target,
                BIG_FILE_SIZE_MB,
                UPLOAD_CHUNK_SIZE_MB,
                TRANSFER_THREADS,
            )
            .await
    }

    async fn upload_metrics(&self) -> Result<()> {
        let response = self.server.get_metrics().await?;
        if !response.is_ok() {
            return Err(Error::internal_with_context(
                SERVER,
                format!("/metrics returned {}: {}", response.status, response.text()),
            ));
        }

        let path = self.config.metrics_file_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &response.body).await?;

        let target = self.config.metrics_uri();
        info!(file = %path.display(), object = %target, "uploading training metrics");
        self.store.upload(&path, &target).await
    }

    async fn terminate(&self) {
        let method = match self.config.runtime {
            TrainingRuntimeType::Peft => TerminateMethod::Post,
            _ => TerminateMethod::Get,
        };
        match self.server.terminate(method).await {
            Ok(response) => info!(status = response.status, "/terminate called"),
            Err(e) => warn!(error = %e, "failed to call /terminate"),
        }
    }
}
