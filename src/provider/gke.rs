//! Google Kubernetes Engine

use kube::api::ApiResource;

use super::{config_api_resource, with_credential_hint, ProviderDriver};
use crate::crd::{ProviderConfig, ProviderKind};
use crate::endpoint::TunnelClassifier;

/// GKE clusters, driven through `gke.cattle.io/v1 GKEClusterConfig`
#[derive(Clone, Copy, Debug, Default)]
pub struct GkeDriver;

impl ProviderDriver for GkeDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gke
    }

    fn api_resource(&self) -> ApiResource {
        config_api_resource("gke.cattle.io", "GKEClusterConfig", "gkeclusterconfigs")
    }

    fn normalize_failure(&self, message: &str) -> String {
        with_credential_hint(message, "gke")
    }

    fn is_private_endpoint(&self, upstream: &ProviderConfig) -> bool {
        matches!(
            upstream,
            ProviderConfig::GkeConfig(c)
                if c.private_cluster_config.as_ref().is_some_and(|p| p.enable_private_endpoint)
        )
    }

    // A private GKE endpoint is an internal IP; dial failures of any kind mean
    // the management network cannot route to it.
    fn tunnel_classifier(&self) -> TunnelClassifier {
        TunnelClassifier::AnyDialFailure
    }
}
