//! Pushing spec changes to a provider config resource
//!
//! When a user edits the cluster record, the new provider spec is written to
//! the config resource. Provider operators take a moment to react, and the
//! resource may briefly stay `active` after the write, so the converger waits
//! a bounded time for the provider to acknowledge the change before deciding
//! whether the update is in flight.

use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::client::{ClusterStore, ConfigResourceClient};
use crate::conditions::ConditionSetter;
use crate::controller::Reconciled;
use crate::crd::{ConditionType, ManagedCluster};
use crate::provider::{ConfigStatus, ProviderDriver};
use crate::Error;

/// Applies desired specs to config resources and waits for acknowledgement
#[derive(Clone)]
pub struct SpecDriftConverger {
    configs: Arc<dyn ConfigResourceClient>,
    clusters: Arc<dyn ClusterStore>,
    conditions: ConditionSetter,
    watch_timeout: Duration,
    requeue_after: Duration,
}

impl SpecDriftConverger {
    /// Create a converger
    pub fn new(
        configs: Arc<dyn ConfigResourceClient>,
        clusters: Arc<dyn ClusterStore>,
        watch_timeout: Duration,
        requeue_after: Duration,
    ) -> Self {
        Self {
            conditions: ConditionSetter::new(clusters.clone()),
            configs,
            clusters,
            watch_timeout,
            requeue_after,
        }
    }

    /// Write `desired` as the spec of `live` and wait for the provider to react
    ///
    /// The watch is opened before the write so the acknowledging event cannot
    /// be missed. If the provider acknowledges within the timeout `Updated`
    /// goes Unknown and a re-run is scheduled; otherwise the applied spec is
    /// recorded and the record returned as is.
    pub async fn converge<P: ProviderDriver + ?Sized>(
        &self,
        driver: &P,
        cluster: &ManagedCluster,
        live: &DynamicObject,
        desired: Value,
    ) -> Result<Reconciled, Error> {
        let name = cluster.name_any();
        let mut watch = self.configs.watch(&name).await?;

        let mut updated = live.clone();
        updated.data["spec"] = desired;
        self.configs.update(&updated).await?;
        info!(cluster = %name, provider = %driver.kind(), "pushed spec change to config resource");

        let acknowledged = tokio::time::timeout(self.watch_timeout, async {
            while let Some(obj) = watch.next().await {
                let phase = driver.classify_phase(&ConfigStatus::of(&obj).phase);
                if driver.acknowledges_update(&phase) {
                    return Some(phase);
                }
                debug!(cluster = %name, %phase, "config resource not yet updating");
            }
            None
        })
        .await
        .ok()
        .flatten();
        drop(watch);

        match acknowledged {
            Some(phase) => {
                info!(cluster = %name, %phase, "provider picked up spec change");
                let cluster = self
                    .conditions
                    .set_unknown(cluster, ConditionType::Updated, "")
                    .await?;
                Ok(Reconciled::requeue(cluster, self.requeue_after))
            }
            None => {
                debug!(cluster = %name, "no phase change observed after spec update");
                let cluster = record_applied_spec(self.clusters.as_ref(), cluster).await?;
                Ok(Reconciled::done(cluster))
            }
        }
    }
}

/// Store the desired provider config as the applied spec, if it differs
pub async fn record_applied_spec(
    clusters: &dyn ClusterStore,
    cluster: &ManagedCluster,
) -> Result<ManagedCluster, Error> {
    let applied = cluster.status.as_ref().and_then(|s| s.applied_spec.as_ref());
    if applied == cluster.spec.provider.as_ref() {
        return Ok(cluster.clone());
    }

    let mut updated = cluster.clone();
    updated.status.get_or_insert_with(Default::default).applied_spec = cluster.spec.provider.clone();
    debug!(cluster = %cluster.name_any(), "recording applied spec");
    clusters.update_status(&updated).await
}
