//! In-pod agents for OME
//!
//! One binary, several subcommands. Each agent is a library module so its
//! pipeline can be driven from tests with mocked collaborators:
//!
//! - [`training`]: sidecar that feeds a training server and ships its output
//! - [`enigma`]: decrypts base model weights before serving
//! - [`adapter_sync`]: keeps fine-tuned adapters on disk in line with a manifest
//! - [`metadata`]: reads a model config from a volume and publishes what it finds

#![deny(missing_docs)]

pub mod adapter_sync;
pub mod archive;
pub mod enigma;
pub mod metadata;
pub mod training;

/// Environment variable prefix shared by every agent setting
pub const ENV_PREFIX: &str = "OME_AGENT";
