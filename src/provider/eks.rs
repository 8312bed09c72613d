//! Amazon Elastic Kubernetes Service

use kube::api::ApiResource;

use super::{config_api_resource, Phase, ProviderDriver};
use crate::crd::{ProviderConfig, ProviderKind};

/// EKS clusters, driven through `eks.cattle.io/v1 EKSClusterConfig`
#[derive(Clone, Copy, Debug, Default)]
pub struct EksDriver;

impl ProviderDriver for EksDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Eks
    }

    fn api_resource(&self) -> ApiResource {
        config_api_resource("eks.cattle.io", "EKSClusterConfig", "eksclusterconfigs")
    }

    // EKS node group statuses lag, so the config can read "active" for a few
    // seconds after an update; only "updating" counts.
    fn acknowledges_update(&self, phase: &Phase) -> bool {
        *phase == Phase::Updating
    }

    fn is_private_endpoint(&self, upstream: &ProviderConfig) -> bool {
        matches!(
            upstream,
            ProviderConfig::EksConfig(c)
                if c.private_access == Some(true) && c.public_access != Some(true)
        )
    }

    fn credential_failure(&self, failure: &str) -> Option<String> {
        failure
            .contains("403")
            .then(|| "cannot access EKS, check cloud credential".to_string())
    }
}
