//! Condition transitions on ManagedCluster records
//!
//! Setting a condition to the (status, message) it already has is a no-op and
//! makes no store call. Otherwise a copy of the record is modified and
//! persisted, and the stored version is returned for the caller to continue
//! with.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::debug;

use crate::client::ClusterStore;
use crate::crd::{Condition, ConditionStatus, ConditionType, ManagedCluster};
use crate::Error;

/// Applies condition transitions through a [`ClusterStore`]
#[derive(Clone)]
pub struct ConditionSetter {
    store: Arc<dyn ClusterStore>,
}

impl ConditionSetter {
    /// Create a setter persisting through `store`
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    /// Set `type_` to True with `message`
    pub async fn set_true(
        &self,
        cluster: &ManagedCluster,
        type_: ConditionType,
        message: &str,
    ) -> Result<ManagedCluster, Error> {
        self.set(cluster, type_, ConditionStatus::True, message).await
    }

    /// Set `type_` to False with `message`
    pub async fn set_false(
        &self,
        cluster: &ManagedCluster,
        type_: ConditionType,
        message: &str,
    ) -> Result<ManagedCluster, Error> {
        self.set(cluster, type_, ConditionStatus::False, message).await
    }

    /// Set `type_` to Unknown with `message`
    pub async fn set_unknown(
        &self,
        cluster: &ManagedCluster,
        type_: ConditionType,
        message: &str,
    ) -> Result<ManagedCluster, Error> {
        self.set(cluster, type_, ConditionStatus::Unknown, message)
            .await
    }

    /// Set `type_` to False with `message` when non-empty, else Unknown with ""
    pub async fn set_failed_or_unknown(
        &self,
        cluster: &ManagedCluster,
        type_: ConditionType,
        message: &str,
    ) -> Result<ManagedCluster, Error> {
        if message.is_empty() {
            self.set_unknown(cluster, type_, "").await
        } else {
            self.set_false(cluster, type_, message).await
        }
    }

    async fn set(
        &self,
        cluster: &ManagedCluster,
        type_: ConditionType,
        status: ConditionStatus,
        message: &str,
    ) -> Result<ManagedCluster, Error> {
        let unchanged = cluster
            .status
            .as_ref()
            .and_then(|s| s.condition(type_))
            .is_some_and(|c| c.matches(status, message));
        if unchanged {
            return Ok(cluster.clone());
        }

        debug!(
            cluster = %cluster.name_any(),
            condition = %type_,
            %status,
            reason = message,
            "updating condition"
        );

        let mut updated = cluster.clone();
        updated
            .status
            .get_or_insert_with(Default::default)
            .set_condition(Condition::new(type_, status, message));

        self.store.update_status(&updated).await
    }
}
