//! VerticaDB operator: reconcile steps, pod facts and the controllers driving them

#![deny(missing_docs)]

/// Superuser password and validation timestamp caches
pub mod cache;
/// Operator-wide settings
pub mod config;
/// Shared controller context
pub mod context;
/// VerticaDB controller
pub mod controller;
/// Administrative operations against the database
pub mod dispatcher;
/// Kubernetes API seam
pub mod kube_client;
/// Command execution in pods
pub mod pod_runner;
/// Observed state of database pods
pub mod podfacts;
/// Per-sandbox config maps
pub mod sandbox_configmap;
/// Sandbox controller
pub mod sandbox_controller;
/// Ordered step execution
pub mod sequencer;
/// Optimistic status and spec writes
pub mod status;
/// Reconcile steps
pub mod steps;
/// Trigger channel between the controllers
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;
