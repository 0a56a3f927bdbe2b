//! Kubernetes access for the training controller
//!
//! Runtime workloads (JobSet, PodGroup) are handled as [`DynamicObject`]s so
//! the controller does not depend on their Rust types.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use ome_common::crd::{
    ClusterBaseModel, ClusterTrainingRuntime, FineTunedWeight, LifeCycleState, TrainingJob,
    TrainingJobStatus, TrainingRuntime,
};
use ome_common::Error;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "ome-training-controller";

/// Trait abstracting Kubernetes operations for the training controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrainingKubeClient: Send + Sync {
    /// Get a ClusterBaseModel by name
    async fn get_cluster_base_model(&self, name: &str)
        -> Result<Option<ClusterBaseModel>, Error>;

    /// Get a namespaced TrainingRuntime
    async fn get_training_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TrainingRuntime>, Error>;

    /// Get a ClusterTrainingRuntime
    async fn get_cluster_training_runtime(
        &self,
        name: &str,
    ) -> Result<Option<ClusterTrainingRuntime>, Error>;

    /// Get a ConfigMap by name
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Get a FineTunedWeight by name
    async fn get_fine_tuned_weight(&self, name: &str) -> Result<Option<FineTunedWeight>, Error>;

    /// Create a FineTunedWeight; returns `false` when it already existed
    async fn create_fine_tuned_weight(&self, weight: &FineTunedWeight) -> Result<bool, Error>;

    /// Write the lifecycle state of a FineTunedWeight
    async fn patch_fine_tuned_weight_state(
        &self,
        name: &str,
        state: LifeCycleState,
    ) -> Result<(), Error>;

    /// Server-side apply a PersistentVolume manifest
    async fn apply_persistent_volume(
        &self,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Server-side apply a PersistentVolumeClaim manifest
    async fn apply_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Get a dynamically typed object
    async fn get_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create a dynamically typed object; returns `false` when it already existed
    async fn create_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<bool, Error>;

    /// Replace a dynamically typed object
    async fn replace_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<(), Error>;

    /// Merge-patch the status of a TrainingJob
    async fn patch_training_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrainingJobStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct TrainingKubeClientImpl {
    client: Client,
}

impl TrainingKubeClientImpl {
    /// Create a new TrainingKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl TrainingKubeClient for TrainingKubeClientImpl {
    async fn get_cluster_base_model(
        &self,
        name: &str,
    ) -> Result<Option<ClusterBaseModel>, Error> {
        let api: Api<ClusterBaseModel> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_training_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TrainingRuntime>, Error> {
        let api: Api<TrainingRuntime> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster_training_runtime(
        &self,
        name: &str,
    ) -> Result<Option<ClusterTrainingRuntime>, Error> {
        let api: Api<ClusterTrainingRuntime> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_fine_tuned_weight(&self, name: &str) -> Result<Option<FineTunedWeight>, Error> {
        let api: Api<FineTunedWeight> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_fine_tuned_weight(&self, weight: &FineTunedWeight) -> Result<bool, Error> {
        let api: Api<FineTunedWeight> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), weight).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(weight = ?weight.metadata.name, "FineTunedWeight already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_fine_tuned_weight_state(
        &self,
        name: &str,
        state: LifeCycleState,
    ) -> Result<(), Error> {
        let api: Api<FineTunedWeight> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": { "state": state } });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn apply_persistent_volume(
        &self,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(manifest),
        )
        .await?;
        debug!(pv = %name, "PersistentVolume ensured via SSA");
        Ok(())
    }

    async fn apply_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
        manifest: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(manifest),
        )
        .await?;
        debug!(pvc = %name, "PersistentVolumeClaim ensured via SSA");
        Ok(())
    }

    async fn get_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.dynamic(resource, namespace).get_opt(name).await?)
    }

    async fn create_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<bool, Error> {
        match self
            .dynamic(resource, namespace)
            .create(&PostParams::default(), object)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<(), Error> {
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("cannot replace an object without a name"))?;
        self.dynamic(resource, namespace)
            .replace(name, &PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn patch_training_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrainingJobStatus,
    ) -> Result<(), Error> {
        let api: Api<TrainingJob> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
