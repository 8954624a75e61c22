//! Workload Backup Kubernetes Operator
//!
//! This operator injects a backup sidecar into workloads selected by
//! BackupPolicy resources and runs recovery Jobs for RecoveryRequest
//! resources, using Custom Resource Definitions (CRDs).

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod mutator;
pub mod queue;
pub mod reconcilers;

pub use error::{Error, Result};
