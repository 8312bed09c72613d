//! Store traits consumed by the reconcilers, with kube-rs backed implementations
//!
//! Every trait is mockable in tests. The `Kube*` implementations translate
//! API 404/409 responses into [`crate::Error::NotFound`] and
//! [`crate::Error::Conflict`] so callers never inspect status codes.

mod cluster;
mod config_resource;
mod secret;

pub use cluster::{ClusterStore, KubeClusterStore};
pub use config_resource::{ConfigResourceClient, ConfigWatch, KubeConfigResourceClient};
pub use secret::{KubeSecretStore, SecretStore};

#[cfg(test)]
pub use cluster::MockClusterStore;
#[cfg(test)]
pub use config_resource::MockConfigResourceClient;
#[cfg(test)]
pub use secret::MockSecretStore;

/// Field manager recorded on writes made by this operator
pub const FIELD_MANAGER: &str = "hosted-operator";
