//! Kubernetes custom and external metrics adapter backed by Azure
//!
//! The binary wires the member crates together:
//! - [`crds`] - CRD manifests and startup installation
//! - [`lookup`] - labels of the objects custom metrics describe
//! - [`server`] - the `external.metrics.k8s.io` and `custom.metrics.k8s.io`
//!   HTTP surface

#![deny(missing_docs)]

pub mod crds;
pub mod lookup;
pub mod server;
