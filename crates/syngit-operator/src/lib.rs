//! syngit admission controller
//!
//! Intercepts writes to scoped Kubernetes resources, commits the resulting
//! manifests to Git on behalf of the requesting user, then lets the write
//! through or blocks it.

/// Admission pipeline (identity, targets, Git push, status)
pub mod admission;
/// Cluster API abstraction
pub mod cluster;
/// Command line configuration
pub mod config;
/// Shared admission dependencies
pub mod context;
/// Controllers driven next to the admission server
pub mod controller;
/// RemoteUserBinding and RemoteTarget provisioning patterns
pub mod pattern;
/// Per-RemoteSyncer interceptor endpoints
pub mod registry;
/// Admission HTTP server
pub mod server;
/// Static CRD validation webhooks
pub mod validators;

#[cfg(test)]
pub(crate) mod testing;
