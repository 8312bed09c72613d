//! Hosted provider capabilities
//!
//! The reconciliation state machine is the same for every hosted provider. What
//! differs is captured by [`ProviderDriver`]: which config resource kind the
//! provider operator watches, how its phases and failure messages read, and
//! how to tell from the upstream spec whether the API endpoint is private.
//!
//! # Supported Providers
//!
//! - [`AksDriver`] - Azure Kubernetes Service
//! - [`EksDriver`] - Amazon Elastic Kubernetes Service
//! - [`GkeDriver`] - Google Kubernetes Engine
//! - [`AlibabaDriver`] - Alibaba Cloud Container Service for Kubernetes

mod aks;
mod alibaba;
mod eks;
mod gke;
mod upstream;

pub use aks::AksDriver;
pub use alibaba::AlibabaDriver;
pub use eks::EksDriver;
pub use gke::GkeDriver;
pub use upstream::{ObservedSpecBuilder, UpstreamSpecBuilder};

#[cfg(test)]
pub use upstream::MockUpstreamSpecBuilder;

use std::fmt;

use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde_json::{json, Value};

use crate::crd::{ManagedCluster, ProviderConfig, ProviderKind};
use crate::endpoint::TunnelClassifier;
use crate::Error;

/// Lifecycle phase reported in a config resource's `status.phase`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// The provider operator is creating the cluster
    Creating,
    /// The cluster is up and matches the config
    Active,
    /// A spec change is being applied
    Updating,
    /// Anything else, including no phase yet
    Other(String),
}

impl Phase {
    /// Parse a reported phase
    pub fn parse(phase: &str) -> Self {
        match phase {
            "creating" => Self::Creating,
            "active" => Self::Active,
            "updating" => Self::Updating,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Active => write!(f, "active"),
            Self::Updating => write!(f, "updating"),
            Self::Other(p) if p.is_empty() => write!(f, "<none>"),
            Self::Other(p) => write!(f, "{}", p),
        }
    }
}

/// What one hosted provider contributes to reconciliation
pub trait ProviderDriver: Send + Sync + 'static {
    /// Provider handled by this driver
    fn kind(&self) -> ProviderKind;

    /// Config resource type the provider operator watches
    fn api_resource(&self) -> ApiResource;

    /// Name of the config resource CRD (`<plural>.<group>`)
    fn crd_name(&self) -> String {
        let ar = self.api_resource();
        format!("{}.{}", ar.plural, ar.group)
    }

    /// Classify a reported phase
    fn classify_phase(&self, phase: &str) -> Phase {
        Phase::parse(phase)
    }

    /// Failure message as it should appear in condition messages
    fn normalize_failure(&self, message: &str) -> String {
        message.to_string()
    }

    /// Whether an observed phase shows the provider picked up a spec update
    fn acknowledges_update(&self, phase: &Phase) -> bool {
        *phase != Phase::Active
    }

    /// Whether the upstream cluster exposes only a private API endpoint
    fn is_private_endpoint(&self, upstream: &ProviderConfig) -> bool;

    /// Policy for deciding that a failed direct probe means "must tunnel"
    fn tunnel_classifier(&self) -> TunnelClassifier {
        TunnelClassifier::ResolutionOrTimeout
    }

    /// Message for `Updated=False` when an active cluster reports a credential failure
    fn credential_failure(&self, _failure: &str) -> Option<String> {
        None
    }
}

/// `status.phase` and `status.failureMessage` of a config resource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigStatus {
    /// Reported phase, empty when none
    pub phase: String,
    /// Reported failure, empty when none
    pub failure_message: String,
}

impl ConfigStatus {
    /// Read the status fields of a config resource
    pub fn of(obj: &DynamicObject) -> Self {
        let field = |name: &str| {
            obj.data
                .get("status")
                .and_then(|s| s.get(name))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            phase: field("phase"),
            failure_message: field("failureMessage"),
        }
    }
}

/// Build an [`ApiResource`] for a provider config kind
pub(crate) fn config_api_resource(group: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, "v1", kind), plural)
}

/// The `spec` of a config resource, `Null` when absent
pub fn live_spec(obj: &DynamicObject) -> Value {
    obj.data.get("spec").cloned().unwrap_or(Value::Null)
}

/// The config resource to create for `cluster`, owned by the cluster record
pub fn build_config_object<P: ProviderDriver + ?Sized>(
    driver: &P,
    cluster: &ManagedCluster,
    namespace: &str,
) -> Result<DynamicObject, Error> {
    let provider = cluster.spec.provider.as_ref().ok_or_else(|| {
        Error::validation(format!("cluster {} has no provider config", cluster.name_any()))
    })?;
    if provider.kind() != driver.kind() {
        return Err(Error::invariant(format!(
            "cluster {} is a {} cluster, not {}",
            cluster.name_any(),
            provider.kind(),
            driver.kind()
        )));
    }

    let mut obj = DynamicObject::new(&cluster.name_any(), &driver.api_resource())
        .within(namespace)
        .data(json!({ "spec": provider.spec_value()? }));
    obj.metadata.owner_references = Some(vec![cluster.owner_reference()?]);
    Ok(obj)
}

/// Prefix `message` with a credential hint when it reports an HTTP 403
pub(crate) fn with_credential_hint(message: &str, provider: &str) -> String {
    if message.contains("403") {
        format!("cannot access {}, check cloud credential: {}", provider, message)
    } else {
        message.to_string()
    }
}
