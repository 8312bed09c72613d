//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster is the user-facing record of a hosted Kubernetes cluster.
//! Users own the spec; the reconcilers in this crate own the status.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::providers::{ProviderConfig, ProviderKind};
use super::types::{Condition, ConditionStatus, ConditionType};

/// Specification for a ManagedCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.hosted.dev",
    version = "v1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mc",
    status = "ManagedClusterStatus",
    namespaced = false,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".status.driver"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.apiEndpoint"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Human-friendly name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Hosted provider configuration; absent for clusters not managed here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
}

impl ManagedClusterSpec {
    /// Provider that owns this cluster, if any
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        self.provider.as_ref().map(ProviderConfig::kind)
    }
}

/// Status for a ManagedCluster
///
/// Written as a whole by [`crate::client::ClusterStore::update_status`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Driver identity (AKS, EKS, GKE, Alibaba)
    #[serde(default)]
    pub driver: Option<String>,

    /// Conditions in insertion order
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Provider config last converged to the config resource
    #[serde(default)]
    pub applied_spec: Option<ProviderConfig>,

    /// Last observed state of the real cluster
    #[serde(default)]
    pub upstream_spec: Option<ProviderConfig>,

    /// Kubernetes API server URL
    #[serde(default)]
    pub api_endpoint: Option<String>,

    /// Base64-encoded PEM CA bundle of the API server
    #[serde(default)]
    pub ca_cert: Option<String>,

    /// Legacy raw service account token, only ever cleared
    #[serde(default)]
    pub service_account_token: Option<String>,

    /// Name of the secret holding the service account token
    #[serde(default)]
    pub service_account_token_secret: Option<String>,

    /// Whether a private-only endpoint must be reached through the tunnel
    #[serde(default)]
    pub private_requires_tunnel: Option<bool>,
}

impl ManagedClusterStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_.as_str())
    }

    /// Status of a condition, Unknown when absent
    pub fn condition_status(&self, type_: ConditionType) -> ConditionStatus {
        self.condition(type_).map(|c| c.status).unwrap_or_default()
    }

    /// Replace or append a condition, keeping the position of an existing one
    pub fn set_condition(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }

    /// Builder-style [`Self::set_condition`]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.set_condition(condition);
        self
    }

    /// Non-empty service account token secret reference
    pub fn token_secret(&self) -> Option<&str> {
        self.service_account_token_secret
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    /// Non-empty API endpoint
    pub fn endpoint(&self) -> Option<&str> {
        self.api_endpoint.as_deref().filter(|s| !s.is_empty())
    }
}

impl ManagedCluster {
    /// Status, or an empty one for records never written by a reconciler
    pub fn status_or_default(&self) -> ManagedClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Status of a condition, Unknown when absent
    pub fn condition_status(&self, type_: ConditionType) -> ConditionStatus {
        self.status
            .as_ref()
            .map(|s| s.condition_status(type_))
            .unwrap_or_default()
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Owner reference pointing at this record
    ///
    /// Records read from the API server always carry a UID; one without is
    /// an [`crate::Error::InvariantViolation`].
    pub fn owner_reference(&self) -> Result<OwnerReference, crate::Error> {
        let uid = self.uid().filter(|u| !u.is_empty()).ok_or_else(|| {
            crate::Error::invariant(format!("cluster {} has no uid", self.name_any()))
        })?;
        Ok(OwnerReference {
            api_version: Self::api_version(&()).to_string(),
            kind: Self::kind(&()).to_string(),
            name: self.name_any(),
            uid,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AksConfigSpec, GkeConfigSpec};
    use kube::CustomResourceExt;

    fn aks_spec() -> ManagedClusterSpec {
        ManagedClusterSpec {
            display_name: Some("prod".to_string()),
            provider: Some(ProviderConfig::AksConfig(AksConfigSpec {
                cluster_name: "prod".to_string(),
                ..Default::default()
            })),
        }
    }

    /// Story: the provider config is tagged by provider under spec.provider
    #[test]
    fn story_provider_config_is_tagged_under_spec() {
        let json = serde_json::to_value(aks_spec()).unwrap();
        assert_eq!(json["provider"]["aksConfig"]["clusterName"], "prod");
        assert_eq!(json["displayName"], "prod");

        let parsed: ManagedClusterSpec = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.provider_kind(), Some(ProviderKind::Aks));
    }

    #[test]
    fn test_spec_without_provider_parses() {
        let parsed: ManagedClusterSpec =
            serde_json::from_value(serde_json::json!({"displayName": "local"})).unwrap();
        assert_eq!(parsed.provider_kind(), None);
    }

    /// Story: clearing a status field reaches the API server as null
    ///
    /// The reconciler patches the whole status; a cleared legacy token must be
    /// sent explicitly or the merge patch would leave it in place.
    #[test]
    fn story_unset_status_fields_serialize_as_null() {
        let status = ManagedClusterStatus {
            service_account_token_secret: Some("cluster-serviceaccounttoken-x".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json["serviceAccountToken"].is_null());
        assert!(json.as_object().unwrap().contains_key("serviceAccountToken"));
        assert_eq!(json["serviceAccountTokenSecret"], "cluster-serviceaccounttoken-x");
    }

    #[test]
    fn test_set_condition_replaces_in_place() {
        let mut status = ManagedClusterStatus::default()
            .with_condition(Condition::new(
                ConditionType::Waiting,
                ConditionStatus::Unknown,
                "",
            ))
            .with_condition(Condition::new(
                ConditionType::Provisioned,
                ConditionStatus::Unknown,
                "",
            ));

        status.set_condition(Condition::new(
            ConditionType::Waiting,
            ConditionStatus::True,
            "",
        ));

        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.conditions[0].type_, "Waiting");
        assert_eq!(
            status.condition_status(ConditionType::Waiting),
            ConditionStatus::True
        );
        assert_eq!(
            status.condition_status(ConditionType::Pending),
            ConditionStatus::Unknown
        );
    }

    #[test]
    fn test_empty_strings_count_as_unset() {
        let status = ManagedClusterStatus {
            api_endpoint: Some(String::new()),
            service_account_token_secret: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(status.endpoint(), None);
        assert_eq!(status.token_secret(), None);
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        let mut cluster = ManagedCluster::new("prod", aks_spec());
        let err = cluster.owner_reference().unwrap_err();
        assert!(matches!(err, crate::Error::InvariantViolation(_)));

        cluster.metadata.uid = Some("uid-1".to_string());
        let owner = cluster.owner_reference().unwrap();
        assert_eq!(owner.api_version, "management.hosted.dev/v1");
        assert_eq!(owner.kind, "ManagedCluster");
        assert_eq!(owner.name, "prod");
        assert_eq!(owner.uid, "uid-1");
    }

    #[test]
    fn test_crd_is_cluster_scoped_with_status() {
        let crd = ManagedCluster::crd();
        assert_eq!(crd.spec.group, "management.hosted.dev");
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "ManagedCluster");

        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().unwrap().status.is_some());
    }

    #[test]
    fn test_upstream_spec_roundtrips_through_status() {
        let status = ManagedClusterStatus {
            upstream_spec: Some(ProviderConfig::GkeConfig(GkeConfigSpec {
                cluster_name: "g".to_string(),
                ..Default::default()
            })),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["upstreamSpec"]["gkeConfig"]["clusterName"], "g");
    }
}
