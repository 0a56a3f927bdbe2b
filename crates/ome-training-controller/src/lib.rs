//! TrainingJob controller for OME
//!
//! Turns a TrainingJob into a FineTunedWeight, a base model volume and the
//! workload objects of its runtime (a JobSet, plus a PodGroup when the
//! runtime gang-schedules), then tracks the workload to a terminal state.

#![deny(missing_docs)]

pub mod annotations;
pub mod client;
pub mod conditions;
pub mod controller;
pub mod fine_tuned_weight;
pub mod runtime;
pub mod storage;

#[cfg(test)]
mod test_helpers;

pub use client::{TrainingKubeClient, TrainingKubeClientImpl};
pub use controller::{error_policy, reconcile_training_job, TrainingContext};
pub use runtime::{RuntimeRegistry, TrainingRuntimeBackend};
