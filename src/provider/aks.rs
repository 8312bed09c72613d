//! Azure Kubernetes Service

use kube::api::ApiResource;

use super::{config_api_resource, ProviderDriver};
use crate::crd::{ProviderConfig, ProviderKind};

/// AKS clusters, driven through `aks.cattle.io/v1 AKSClusterConfig`
#[derive(Clone, Copy, Debug, Default)]
pub struct AksDriver;

impl ProviderDriver for AksDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aks
    }

    fn api_resource(&self) -> ApiResource {
        config_api_resource("aks.cattle.io", "AKSClusterConfig", "aksclusterconfigs")
    }

    fn is_private_endpoint(&self, upstream: &ProviderConfig) -> bool {
        matches!(upstream, ProviderConfig::AksConfig(c) if c.private_cluster == Some(true))
    }
}
