//! BaseModel and ClusterBaseModel controllers for OME
//!
//! Drives model placement through the per-node status ConfigMaps, with
//! registry validation for `hf://` storage and metadata extraction for
//! `pvc://` storage.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod metadata_job;
pub mod node;
pub mod pvc;
pub mod registry;
pub mod status;

pub use client::{ModelKubeClient, ModelKubeClientImpl, ModelKind, ModelRef};
pub use controller::{
    error_policy, reconcile_base_model, reconcile_cluster_base_model, ModelContext,
};
pub use node::{
    base_models_for_config_map, cleanup_node_config_map, cluster_base_models_for_config_map,
};
pub use registry::{HuggingFaceRegistry, ModelRegistry};
