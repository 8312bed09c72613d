//! Building the observed upstream state of a hosted cluster

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use super::live_spec;
use crate::crd::{ManagedCluster, ProviderConfig};
use crate::Error;

/// Produces the upstream spec recorded as a cluster's baseline
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpstreamSpecBuilder: Send + Sync {
    /// Build the upstream spec of `cluster` given its live config resource
    async fn build(
        &self,
        cluster: &ManagedCluster,
        live: &DynamicObject,
    ) -> Result<ProviderConfig, Error>;
}

/// [`UpstreamSpecBuilder`] that takes the spec the provider operator reports
///
/// This is the default wired by the controller context. It reads the config
/// resource spec back, which right after creation is the desired spec this
/// operator wrote, not state observed in the cloud. Deployments that need the
/// real cloud state as the baseline inject a provider-specific builder
/// querying the provider API through
/// [`crate::controller::ContextBuilder::upstream_builder`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ObservedSpecBuilder;

#[async_trait]
impl UpstreamSpecBuilder for ObservedSpecBuilder {
    async fn build(
        &self,
        cluster: &ManagedCluster,
        live: &DynamicObject,
    ) -> Result<ProviderConfig, Error> {
        let kind = cluster.spec.provider_kind().ok_or_else(|| {
            Error::validation(format!("cluster {} has no provider config", cluster.name_any()))
        })?;
        let spec = live_spec(live);
        if spec == Value::Null {
            return Err(Error::not_yet_available(format!(
                "config resource {} has no spec",
                live.name_any()
            )));
        }
        ProviderConfig::from_spec_value(kind, spec).map_err(|e| {
            Error::serialization(format!(
                "config resource {} spec is not a valid {} config: {}",
                live.name_any(),
                kind,
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EksConfigSpec, ManagedClusterSpec};
    use crate::provider::{EksDriver, ProviderDriver};
    use serde_json::json;

    fn eks_cluster() -> ManagedCluster {
        ManagedCluster::new(
            "c1",
            ManagedClusterSpec {
                display_name: None,
                provider: Some(ProviderConfig::EksConfig(EksConfigSpec::default())),
            },
        )
    }

    /// Story: an imported cluster's baseline is whatever the operator observed
    #[tokio::test]
    async fn story_baseline_comes_from_live_spec() {
        let live = DynamicObject::new("c1", &EksDriver.api_resource()).data(json!({
            "spec": {
                "displayName": "prod",
                "region": "us-west-2",
                "imported": true,
                "amazonCredentialSecret": "ns:cc",
                "kubernetesVersion": "1.30",
                "publicAccess": true
            }
        }));

        let upstream = ObservedSpecBuilder.build(&eks_cluster(), &live).await.unwrap();
        let ProviderConfig::EksConfig(spec) = upstream else {
            panic!("expected EKS config");
        };
        assert_eq!(spec.kubernetes_version.as_deref(), Some("1.30"));
        assert_eq!(spec.public_access, Some(true));
    }

    #[tokio::test]
    async fn test_missing_spec_is_not_yet_available() {
        let live = DynamicObject::new("c1", &EksDriver.api_resource());
        let err = ObservedSpecBuilder.build(&eks_cluster(), &live).await.unwrap_err();
        assert!(matches!(err, Error::NotYetAvailable(_)));
    }

    #[tokio::test]
    async fn test_malformed_spec_is_a_serialization_error() {
        let live = DynamicObject::new("c1", &EksDriver.api_resource())
            .data(json!({ "spec": { "region": 42 } }));
        let err = ObservedSpecBuilder.build(&eks_cluster(), &live).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
