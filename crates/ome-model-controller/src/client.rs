//! Kubernetes access for the model controllers
//!
//! Everything the reconcilers read or write goes through [`ModelKubeClient`]
//! so reconciliation can be tested against a mock.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, PersistentVolumeClaim, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use ome_common::crd::{BaseModel, BaseModelSpec, BaseModelStatus, ClusterBaseModel};
use ome_common::{Error, MODEL_STATUS_LABEL_SELECTOR};

/// Which of the two model kinds an operation targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    /// Namespaced BaseModel
    BaseModel,
    /// Cluster-scoped ClusterBaseModel
    ClusterBaseModel,
}

/// Address of a BaseModel or ClusterBaseModel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelRef {
    /// Model kind
    pub kind: ModelKind,
    /// Namespace, `None` for cluster-scoped models
    pub namespace: Option<String>,
    /// Model name
    pub name: String,
}

impl ModelRef {
    /// Reference a namespaced BaseModel
    pub fn base_model(namespace: &str, name: &str) -> Self {
        Self {
            kind: ModelKind::BaseModel,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Reference a ClusterBaseModel
    pub fn cluster_base_model(name: &str) -> Self {
        Self {
            kind: ModelKind::ClusterBaseModel,
            namespace: None,
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Trait abstracting Kubernetes operations for the model controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ModelKubeClient: Send + Sync {
    /// Add a finalizer if it is not already present
    async fn add_finalizer(&self, model: &ModelRef, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer; a model that is already gone is not an error
    async fn remove_finalizer(&self, model: &ModelRef, finalizer: &str) -> Result<(), Error>;

    /// Merge-patch annotations onto the model
    async fn patch_annotations(
        &self,
        model: &ModelRef,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Merge-patch the model spec
    async fn patch_spec(&self, model: &ModelRef, spec: &BaseModelSpec) -> Result<(), Error>;

    /// Merge-patch the model status
    async fn patch_status(&self, model: &ModelRef, status: &BaseModelStatus)
        -> Result<(), Error>;

    /// List the per-node model status ConfigMaps in `namespace`
    async fn list_model_status_config_maps(&self, namespace: &str)
        -> Result<Vec<ConfigMap>, Error>;

    /// Whether a node exists
    async fn node_exists(&self, name: &str) -> Result<bool, Error>;

    /// Get a ConfigMap by name
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Delete a ConfigMap; a missing ConfigMap is not an error
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a PersistentVolumeClaim by name
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Get a Job by name
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// Create a Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;

    /// Read one key of a Secret as UTF-8
    async fn get_secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, Error>;
}

/// Real Kubernetes client implementation
pub struct ModelKubeClientImpl {
    client: Client,
}

impl ModelKubeClientImpl {
    /// Create a new ModelKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn merge_patch(&self, model: &ModelRef, patch: &serde_json::Value) -> Result<(), Error> {
        let pp = PatchParams::default();
        match (model.kind, model.namespace.as_deref()) {
            (ModelKind::BaseModel, Some(ns)) => {
                let api: Api<BaseModel> = Api::namespaced(self.client.clone(), ns);
                api.patch(&model.name, &pp, &Patch::Merge(patch)).await?;
            }
            (ModelKind::BaseModel, None) => {
                return Err(Error::validation_for(
                    model.name.clone(),
                    "BaseModel reference without a namespace",
                ))
            }
            (ModelKind::ClusterBaseModel, _) => {
                let api: Api<ClusterBaseModel> = Api::all(self.client.clone());
                api.patch(&model.name, &pp, &Patch::Merge(patch)).await?;
            }
        }
        Ok(())
    }

    async fn current_finalizers(&self, model: &ModelRef) -> Result<Option<Vec<String>>, Error> {
        match (model.kind, model.namespace.as_deref()) {
            (ModelKind::BaseModel, Some(ns)) => {
                let api: Api<BaseModel> = Api::namespaced(self.client.clone(), ns);
                finalizers_of(api, &model.name).await
            }
            (ModelKind::BaseModel, None) => Err(Error::validation_for(
                model.name.clone(),
                "BaseModel reference without a namespace",
            )),
            (ModelKind::ClusterBaseModel, _) => {
                let api: Api<ClusterBaseModel> = Api::all(self.client.clone());
                finalizers_of(api, &model.name).await
            }
        }
    }
}

async fn finalizers_of<K>(api: Api<K>, name: &str) -> Result<Option<Vec<String>>, Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    Ok(api
        .get_opt(name)
        .await?
        .map(|obj| obj.meta().finalizers.clone().unwrap_or_default()))
}

#[async_trait]
impl ModelKubeClient for ModelKubeClientImpl {
    async fn add_finalizer(&self, model: &ModelRef, finalizer: &str) -> Result<(), Error> {
        let Some(mut finalizers) = self.current_finalizers(model).await? else {
            return Ok(());
        };
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.merge_patch(model, &patch).await
    }

    async fn remove_finalizer(&self, model: &ModelRef, finalizer: &str) -> Result<(), Error> {
        let Some(finalizers) = self.current_finalizers(model).await? else {
            debug!(model = %model, "model already gone, nothing to unblock");
            return Ok(());
        };
        if !finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != finalizer).collect();

        let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
        self.merge_patch(model, &patch).await
    }

    async fn patch_annotations(
        &self,
        model: &ModelRef,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.merge_patch(model, &patch).await
    }

    async fn patch_spec(&self, model: &ModelRef, spec: &BaseModelSpec) -> Result<(), Error> {
        let patch = serde_json::json!({ "spec": spec });
        self.merge_patch(model, &patch).await
    }

    async fn patch_status(
        &self,
        model: &ModelRef,
        status: &BaseModelStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        let pp = PatchParams::default();
        match (model.kind, model.namespace.as_deref()) {
            (ModelKind::BaseModel, Some(ns)) => {
                let api: Api<BaseModel> = Api::namespaced(self.client.clone(), ns);
                api.patch_status(&model.name, &pp, &Patch::Merge(&patch))
                    .await?;
            }
            (ModelKind::BaseModel, None) => {
                return Err(Error::validation_for(
                    model.name.clone(),
                    "BaseModel reference without a namespace",
                ))
            }
            (ModelKind::ClusterBaseModel, _) => {
                let api: Api<ClusterBaseModel> = Api::all(self.client.clone());
                api.patch_status(&model.name, &pp, &Patch::Merge(&patch))
                    .await?;
            }
        }
        Ok(())
    }

    async fn list_model_status_config_maps(
        &self,
        namespace: &str,
    ) -> Result<Vec<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(MODEL_STATUS_LABEL_SELECTOR);
        Ok(api.list(&lp).await?.items)
    }

    async fn node_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(configmap = %name, "ConfigMap not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(job = ?job.metadata.name, "Job already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        Ok(secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned()))
    }
}
