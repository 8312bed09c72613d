//! Hosted operator - reconciliation core for hosted Kubernetes clusters
//!
//! Keeps a `ManagedCluster` record in sync with the provider config resource
//! (AKS, EKS, GKE, Alibaba ACK) that a provider operator acts on, and derives
//! the record's conditions, endpoint, CA and access token from it.
//!
//! # Modules
//!
//! - [`crd`] - The `ManagedCluster` resource and the provider config specs
//! - [`controller`] - Per-provider reconcilers and the kube-runtime adapters
//! - [`provider`] - Provider drivers (phase, failure and endpoint rules)
//! - [`drift`] - Pushing spec edits to config resources
//! - [`endpoint`] - CA/endpoint capture and direct vs. tunneled access
//! - [`secrets`] - Credential secret lifecycle
//! - [`conditions`] - Compare-and-skip condition writes
//! - [`client`] - Store traits and their kube-rs implementations
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod client;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod drift;
pub mod endpoint;
pub mod error;
pub mod provider;
pub mod retry;
pub mod secrets;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
