//! Alibaba Cloud Container Service for Kubernetes

use kube::api::ApiResource;

use super::{config_api_resource, with_credential_hint, ProviderDriver};
use crate::crd::{ProviderConfig, ProviderKind};

/// ACK clusters, driven through `ali.cattle.io/v1 ALIClusterConfig`
#[derive(Clone, Copy, Debug, Default)]
pub struct AlibabaDriver;

impl ProviderDriver for AlibabaDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Alibaba
    }

    fn api_resource(&self) -> ApiResource {
        config_api_resource("ali.cattle.io", "ALIClusterConfig", "aliclusterconfigs")
    }

    fn normalize_failure(&self, message: &str) -> String {
        with_credential_hint(message, "alibaba cloud")
    }

    /// ACK endpoints are private unless public access was explicitly enabled
    fn is_private_endpoint(&self, upstream: &ProviderConfig) -> bool {
        match upstream {
            ProviderConfig::AliConfig(c) => c.endpoint_public_access != Some(true),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AliConfigSpec;

    fn upstream(endpoint_public_access: Option<bool>) -> ProviderConfig {
        ProviderConfig::AliConfig(AliConfigSpec {
            endpoint_public_access,
            ..Default::default()
        })
    }

    #[test]
    fn test_private_unless_public_access_enabled() {
        assert!(AlibabaDriver.is_private_endpoint(&upstream(None)));
        assert!(AlibabaDriver.is_private_endpoint(&upstream(Some(false))));
        assert!(!AlibabaDriver.is_private_endpoint(&upstream(Some(true))));
    }

    #[test]
    fn test_403_gets_credential_hint() {
        assert_eq!(
            AlibabaDriver.normalize_failure("ErrorCode: 403"),
            "cannot access alibaba cloud, check cloud credential: ErrorCode: 403"
        );
    }
}
