//! ManagedCluster record store

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use super::FIELD_MANAGER;
use crate::crd::ManagedCluster;
use crate::Error;

const KIND: &str = "ManagedCluster";

/// Write access to ManagedCluster status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Persist `cluster.status`, guarded by `cluster`'s resourceVersion
    ///
    /// The stored status becomes exactly `cluster.status`; fields unset here
    /// are unset on the server. Returns the stored record. Fails with
    /// [`Error::Conflict`] when the record changed since `cluster` was read.
    async fn update_status(&self, cluster: &ManagedCluster) -> Result<ManagedCluster, Error>;
}

/// [`ClusterStore`] backed by the Kubernetes API
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Body of the status replace: the whole record, carrying its resourceVersion
fn status_body(cluster: &ManagedCluster) -> Result<Vec<u8>, Error> {
    if cluster.resource_version().is_none() {
        return Err(Error::invariant(format!(
            "{} {} has no resourceVersion",
            KIND,
            cluster.name_any()
        )));
    }
    serde_json::to_vec(cluster).map_err(|e| Error::serialization(e.to_string()))
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn update_status(&self, cluster: &ManagedCluster) -> Result<ManagedCluster, Error> {
        let name = cluster.name_any();
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        // PUT replaces nested objects wholesale, unlike a merge patch
        api.replace_status(&name, &params, status_body(cluster)?)
            .await
            .map_err(|e| Error::from_kube(e, KIND, &name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AksConfigSpec, ManagedClusterSpec, ManagedClusterStatus, ProviderConfig};

    fn cluster(kubernetes_version: Option<&str>) -> ManagedCluster {
        let provider = ProviderConfig::AksConfig(AksConfigSpec {
            cluster_name: "c1".to_string(),
            kubernetes_version: kubernetes_version.map(str::to_string),
            ..Default::default()
        });
        let mut cluster = ManagedCluster::new(
            "c1",
            ManagedClusterSpec {
                display_name: None,
                provider: Some(provider.clone()),
            },
        );
        cluster.metadata.resource_version = Some("42".to_string());
        cluster.status = Some(ManagedClusterStatus {
            applied_spec: Some(provider),
            ..Default::default()
        });
        cluster
    }

    /// Story: removing an optional provider field clears it from the stored status
    ///
    /// The server stores the body as is, so what the body decodes to is what
    /// the next reconcile reads back.
    #[test]
    fn story_removed_field_does_not_survive_the_write() {
        let stored_before = cluster(Some("1.28"));
        let mut desired = cluster(None);
        desired.status = stored_before.status.clone();
        desired.status.as_mut().unwrap().applied_spec = desired.spec.provider.clone();

        let body = status_body(&desired).unwrap();
        let stored_after: ManagedCluster = serde_json::from_slice(&body).unwrap();

        let applied = stored_after.status.unwrap().applied_spec.unwrap();
        let ProviderConfig::AksConfig(aks) = &applied else {
            panic!("expected AKS config");
        };
        assert_eq!(aks.kubernetes_version, None);
        assert_eq!(Some(&applied), desired.spec.provider.as_ref());
        assert_eq!(
            stored_after.metadata.resource_version.as_deref(),
            Some("42")
        );
    }

    #[test]
    fn test_write_without_resource_version_is_rejected() {
        let mut unread = cluster(Some("1.28"));
        unread.metadata.resource_version = None;
        assert!(matches!(
            status_body(&unread),
            Err(Error::InvariantViolation(_))
        ));
    }
}
