//! OME operator - model placement and training lifecycle controllers

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DynamicObject, Patch, PatchParams};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt, Resource, ResourceExt};

use ome_common::crd::{
    BaseModel, ClusterBaseModel, ClusterTrainingRuntime, FineTunedWeight, ModelResource, TrainingJob,
    TrainingRuntime,
};
use ome_common::telemetry::{init_telemetry, TelemetryConfig};
use ome_common::{ome_namespace, KubeEventPublisher, MODEL_STATUS_LABEL_SELECTOR};
use ome_model_controller::metadata_job::DEFAULT_OME_AGENT_IMAGE;
use ome_model_controller::{
    base_models_for_config_map, cleanup_node_config_map, cluster_base_models_for_config_map,
    reconcile_base_model, reconcile_cluster_base_model, HuggingFaceRegistry, ModelContext,
    ModelKubeClient, ModelKubeClientImpl,
};
use ome_training_controller::runtime::jobset::jobset_resource;
use ome_training_controller::{
    reconcile_training_job, RuntimeRegistry, TrainingContext, TrainingKubeClient,
    TrainingKubeClientImpl,
};

const FIELD_MANAGER: &str = "ome-operator";

/// OME - declarative model distribution and fine-tuning on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "ome-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    ///
    /// Reconciles BaseModels and ClusterBaseModels against the per-node
    /// status ConfigMaps and drives TrainingJobs through their runtime.
    Controller,
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Image of the metadata extraction Job
    #[arg(long, env = "OME_AGENT_IMAGE", default_value = DEFAULT_OME_AGENT_IMAGE)]
    agent_image: String,

    /// Skip installing CRDs on startup
    #[arg(long, env = "OME_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,
}

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        BaseModel::crd(),
        ClusterBaseModel::crd(),
        TrainingJob::crd(),
        TrainingRuntime::crd(),
        ClusterTrainingRuntime::crd(),
        FineTunedWeight::crd(),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}. \
             The operator cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig::for_service("ome-operator"))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controllers(cli.controller).await,
    }
}

/// Install or update every OME CRD with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }
    tracing::info!("All OME CRDs installed/updated");
    Ok(())
}

/// Owner mapping for Jobs whose controller is cluster-scoped; `owns` would
/// scope the reference to the Job's namespace
fn cluster_base_models_owning_job(job: Job) -> Option<ObjectRef<ClusterBaseModel>> {
    job.owner_references()
        .iter()
        .find(|o| o.kind == ClusterBaseModel::KIND && o.controller == Some(true))
        .map(|o| ObjectRef::new(&o.name))
}

/// Delete the status ConfigMap of every node that goes away
async fn watch_node_deletions(
    client: Client,
    kube: Arc<dyn ModelKubeClient>,
    status_namespace: String,
) {
    let nodes: Api<Node> = Api::all(client);
    let mut events = watcher::watcher(nodes, WatcherConfig::default())
        .default_backoff()
        .boxed();

    loop {
        match events.try_next().await {
            Ok(Some(watcher::Event::Delete(node))) => {
                let node_name = node.name_any();
                match cleanup_node_config_map(kube.as_ref(), &status_namespace, &node_name).await {
                    Ok(true) => tracing::info!(node = %node_name, "Removed status ConfigMap of deleted node"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(node = %node_name, error = %e, "Failed to clean up node ConfigMap"),
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => tracing::warn!(error = %e, "Node watch error"),
        }
    }
}

async fn run_controllers(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    if !args.skip_crd_install {
        ensure_crds_installed(&client).await?;
    }

    let status_namespace = ome_namespace();
    tracing::info!(namespace = %status_namespace, "Starting OME controllers");

    let model_kube: Arc<dyn ModelKubeClient> = Arc::new(ModelKubeClientImpl::new(client.clone()));
    let model_ctx = Arc::new(ModelContext::new(
        model_kube.clone(),
        Arc::new(HuggingFaceRegistry::new()?),
        Arc::new(KubeEventPublisher::new(client.clone(), "basemodel-controller")),
        status_namespace.clone(),
        args.agent_image,
    ));

    let training_kube: Arc<dyn TrainingKubeClient> =
        Arc::new(TrainingKubeClientImpl::new(client.clone()));
    let training_ctx = Arc::new(TrainingContext::new(
        training_kube.clone(),
        RuntimeRegistry::with_jobset(training_kube),
        Arc::new(KubeEventPublisher::new(client.clone(), "trainingjob-controller")),
        status_namespace.clone(),
    ));

    let status_maps = || -> Api<ConfigMap> { Api::namespaced(client.clone(), &status_namespace) };
    let status_watch = || WatcherConfig::default().labels(MODEL_STATUS_LABEL_SELECTOR);

    let base_model_controller = Controller::new(
        Api::<BaseModel>::all(client.clone()),
        WatcherConfig::default(),
    )
    .owns(Api::<Job>::all(client.clone()), WatcherConfig::default())
    .watches(status_maps(), status_watch(), base_models_for_config_map)
    .shutdown_on_signal()
    .run(
        reconcile_base_model,
        ome_model_controller::error_policy,
        model_ctx.clone(),
    )
    .for_each(|result| async move {
        match result {
            Ok(action) => tracing::debug!(?action, "BaseModel reconciliation completed"),
            Err(e) => tracing::error!(error = ?e, "BaseModel reconciliation error"),
        }
    });

    let cluster_base_model_controller = Controller::new(
        Api::<ClusterBaseModel>::all(client.clone()),
        WatcherConfig::default(),
    )
    .watches(
        Api::<Job>::all(client.clone()),
        WatcherConfig::default(),
        cluster_base_models_owning_job,
    )
    .watches(status_maps(), status_watch(), cluster_base_models_for_config_map)
    .shutdown_on_signal()
    .run(
        reconcile_cluster_base_model,
        ome_model_controller::error_policy,
        model_ctx.clone(),
    )
    .for_each(|result| async move {
        match result {
            Ok(action) => tracing::debug!(?action, "ClusterBaseModel reconciliation completed"),
            Err(e) => tracing::error!(error = ?e, "ClusterBaseModel reconciliation error"),
        }
    });

    let jobsets = jobset_resource();
    let training_controller = Controller::new(
        Api::<TrainingJob>::all(client.clone()),
        WatcherConfig::default(),
    )
    .owns_with(
        Api::<DynamicObject>::all_with(client.clone(), &jobsets),
        jobsets.clone(),
        WatcherConfig::default(),
    )
    .shutdown_on_signal()
    .run(
        reconcile_training_job,
        ome_training_controller::error_policy,
        training_ctx,
    )
    .for_each(|result| async move {
        match result {
            Ok(action) => tracing::debug!(?action, "TrainingJob reconciliation completed"),
            Err(e) => tracing::error!(error = ?e, "TrainingJob reconciliation error"),
        }
    });

    let node_watcher = watch_node_deletions(client.clone(), model_kube, status_namespace.clone());

    tokio::select! {
        _ = base_model_controller => tracing::info!("BaseModel controller completed"),
        _ = cluster_base_model_controller => tracing::info!("ClusterBaseModel controller completed"),
        _ = training_controller => tracing::info!("TrainingJob controller completed"),
        _ = node_watcher => tracing::info!("Node watcher completed"),
    }

    tracing::info!("OME operator shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_crd_is_listed_once() {
        let mut names: Vec<String> = all_crds().iter().map(|c| c.name_any()).collect();
        names.sort();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
        assert!(names.contains(&"basemodels.ome.io".to_string()));
        assert!(names.contains(&"trainingjobs.ome.io".to_string()));
    }

    #[test]
    fn test_cluster_scoped_job_owner_mapping() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

        let owner = |kind: &str, controller| OwnerReference {
            api_version: "ome.io/v1beta1".to_string(),
            kind: kind.to_string(),
            name: "llama".to_string(),
            uid: "u-1".to_string(),
            controller: Some(controller),
            ..Default::default()
        };
        let job = |refs| Job {
            metadata: ObjectMeta {
                name: Some("llama-metadata-extraction".to_string()),
                namespace: Some("models".to_string()),
                owner_references: Some(refs),
                ..Default::default()
            },
            ..Default::default()
        };

        let mapped = cluster_base_models_owning_job(job(vec![owner("ClusterBaseModel", true)]));
        assert_eq!(mapped, Some(ObjectRef::new("llama")));
        assert!(cluster_base_models_owning_job(job(vec![owner("BaseModel", true)])).is_none());
        assert!(cluster_base_models_owning_job(job(vec![owner("ClusterBaseModel", false)])).is_none());
    }

    #[test]
    fn test_crd_flag_parses() {
        let cli = Cli::parse_from(["ome-operator", "--crd"]);
        assert!(cli.crd);
        assert!(cli.command.is_none());
    }
}
