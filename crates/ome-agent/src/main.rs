//! OME agent - in-pod helpers for training and serving

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tracing::{error, info};

use ome_common::object_store::{LocalObjectStore, ObjectStore};
use ome_common::telemetry::{init_telemetry, TelemetryConfig};

use ome_agent::adapter_sync::{AdapterSync, AdapterSyncConfig};
use ome_agent::enigma::kms::{MountedKeyStore, MountedSecretVault};
use ome_agent::enigma::shape::KubeNodeShapeResolver;
use ome_agent::enigma::{Enigma, EnigmaConfig, EnigmaServices};
use ome_agent::metadata::{KubeMetadataSink, MetadataAgent, MetadataConfig};
use ome_agent::training::config::TrainingConfig;
use ome_agent::training::{HttpFineTuneClient, TrainingAgent};

/// OME agent - training sidecar, weight decryption, adapter sync and metadata extraction
#[derive(Parser, Debug)]
#[command(name = "ome-agent", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a training server and ship its output
    TrainingAgent(TrainingArgs),

    /// Decrypt base model weights ahead of serving
    Enigma(EnigmaArgs),

    /// Keep fine-tuned adapters on disk in line with a mounted manifest
    ServingAgent(ServingArgs),

    /// Read a model config from a volume and publish it as a ConfigMap
    ModelMetadata(MetadataConfig),
}

/// Object storage mounted into the pod
#[derive(Args, Debug)]
struct StoreArgs {
    /// Root of the object storage mount, laid out as `<namespace>/<bucket>/<object>`
    #[arg(long, env = "OME_AGENT_OBJECT_STORE_ROOT", default_value = "/mnt/object-store")]
    object_store_root: PathBuf,
}

impl StoreArgs {
    fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::new(LocalObjectStore::new(&self.object_store_root))
    }
}

#[derive(Args, Debug)]
struct TrainingArgs {
    #[command(flatten)]
    config: TrainingConfig,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args, Debug)]
struct EnigmaArgs {
    #[command(flatten)]
    config: EnigmaConfig,

    /// Directory holding the mounted master key index and key material
    #[arg(long, env = "OME_AGENT_KMS_KEY_DIRECTORY", default_value = "/etc/ome/kms")]
    kms_key_dir: PathBuf,

    /// Directory holding mounted vault secrets
    #[arg(long, env = "OME_AGENT_VAULT_DIRECTORY", default_value = "/etc/ome/vault")]
    vault_dir: PathBuf,

    /// Node this pod runs on, for shape lookup
    #[arg(long, env = "NODE_NAME", default_value = "")]
    node_name: String,
}

#[derive(Args, Debug)]
struct ServingArgs {
    #[command(flatten)]
    config: AdapterSyncConfig,

    #[command(flatten)]
    store: StoreArgs,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::TrainingAgent(_) => "training-agent",
            Commands::Enigma(_) => "enigma",
            Commands::ServingAgent(_) => "serving-agent",
            Commands::ModelMetadata(_) => "model-metadata",
        }
    }
}

impl Cli {
    async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Commands::TrainingAgent(args) => {
                let server = HttpFineTuneClient::new(args.config.server_url.clone())?;
                TrainingAgent::new(args.config, args.store.store(), Arc::new(server))?
                    .run()
                    .await?;
            }
            Commands::Enigma(args) => {
                let client = Client::try_default().await?;
                let services = EnigmaServices {
                    keys: Arc::new(MountedKeyStore::new(&args.kms_key_dir)),
                    crypto: Arc::new(MountedKeyStore::new(&args.kms_key_dir)),
                    vault: Arc::new(MountedSecretVault::new(&args.vault_dir)),
                    shapes: Arc::new(KubeNodeShapeResolver::new(client, args.node_name)),
                };
                Enigma::new(args.config, services)?.run().await?;
            }
            Commands::ServingAgent(args) => {
                AdapterSync::new(args.config, args.store.store()).run().await?;
            }
            Commands::ModelMetadata(config) => {
                let client = Client::try_default().await?;
                let sink = KubeMetadataSink::new(client, config.output_namespace.clone());
                MetadataAgent::new(config, Arc::new(sink))?.run().await?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    init_telemetry(TelemetryConfig::for_service("ome-agent"))?;

    let cli = Cli::parse();
    info!(command = cli.command.name(), "starting ome-agent");
    if let Err(e) = cli.run().await {
        error!(error = %e, "ome-agent failed");
        return Err(e);
    }
    Ok(())
}
