//! Node shape lookup for TensorRT-LLM engine directories

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use ome_common::{Error, Result};

/// Well-known node label carrying the instance shape
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
/// Deprecated spelling of [`INSTANCE_TYPE_LABEL`]
pub const DEPRECATED_INSTANCE_TYPE_LABEL: &str = "beta.kubernetes.io/instance-type";

/// Finds the shape of the node the agent runs on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeShapeResolver: Send + Sync {
    /// Full shape name, e.g. `BM.GPU.H100.8`
    async fn instance_shape(&self) -> Result<String>;
}

/// Reads the instance-type label of a node through the API server
pub struct KubeNodeShapeResolver {
    client: Client,
    node_name: String,
}

impl KubeNodeShapeResolver {
    /// Resolver for `node_name`
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl NodeShapeResolver for KubeNodeShapeResolver {
    async fn instance_shape(&self) -> Result<String> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(&self.node_name).await?;
        let labels = node.labels();
        labels
            .get(INSTANCE_TYPE_LABEL)
            .or_else(|| labels.get(DEPRECATED_INSTANCE_TYPE_LABEL))
            .cloned()
            .ok_or_else(|| {
                Error::validation_for(
                    &self.node_name,
                    format!("node has no {INSTANCE_TYPE_LABEL} label"),
                )
            })
    }
}

/// Reduce a shape name to the alias used in engine directory names.
///
/// `BM.GPU.H100.8` becomes `H100`; numbered GPU generations map to their
/// accelerator (`BM.GPU4.8` becomes `A100`). Unknown shapes pass through.
pub fn shape_alias(shape: &str) -> String {
    let segments: Vec<&str> = shape.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "GPU" => {
                if let Some(model) = segments.get(i + 1).filter(|s| !s.is_empty()) {
                    return model.to_string();
                }
            }
            "GPU2" => return "P100".to_string(),
            "GPU3" => return "V100".to_string(),
            "GPU4" => return "A100".to_string(),
            _ => {}
        }
    }
    shape.to_string()
}
