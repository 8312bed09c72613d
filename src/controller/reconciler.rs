//! Per-provider cluster reconciliation
//!
//! [`ClusterReconciler`] drives one ManagedCluster towards its desired state
//! through the provider's config resource. Each invocation does the next piece
//! of outstanding work and returns; writes to the record trigger the next
//! invocation, and phases that need polling schedule one via
//! [`Reconciled::requeue_after`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::client::{ClusterStore, ConfigResourceClient, SecretStore};
use crate::conditions::ConditionSetter;
use crate::config::OperatorConfig;
use crate::crd::{ConditionStatus, ConditionType, ManagedCluster, ProviderKind};
use crate::drift::{record_applied_spec, SpecDriftConverger};
use crate::endpoint::{
    capture_ca_and_endpoint, AccessVerdict, EndpointAccessResolver, TokenIssuer, TransportFactory,
};
use crate::provider::{
    build_config_object, live_spec, ConfigStatus, Phase, ProviderDriver, UpstreamSpecBuilder,
};
use crate::secrets::SecretMigrator;
use crate::Error;

const WAITING_FOR_API: &str = "Waiting for API to be available";
const WAITING_FOR_AGENT: &str = "waiting for cluster agent to be deployed";

/// Outcome of one reconcile invocation
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciled {
    /// The record as last persisted
    pub cluster: ManagedCluster,
    /// Run again after this delay; `None` waits for the next change
    pub requeue_after: Option<Duration>,
}

impl Reconciled {
    /// Nothing left to do until the record or its config resource changes
    pub fn done(cluster: ManagedCluster) -> Self {
        Self {
            cluster,
            requeue_after: None,
        }
    }

    /// Run again after `after`
    pub fn requeue(cluster: ManagedCluster, after: Duration) -> Self {
        Self {
            cluster,
            requeue_after: Some(after),
        }
    }
}

/// A provider's reconciler, as seen by the dispatcher
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReconcileCluster: Send + Sync {
    /// Provider whose clusters this reconciler owns
    fn kind(&self) -> ProviderKind;

    /// Reconcile one cluster record
    async fn reconcile(&self, cluster: &ManagedCluster) -> Result<Reconciled, Error>;
}

/// Stores and services a [`ClusterReconciler`] is built from
#[derive(Clone)]
pub struct ReconcilerDeps {
    /// ManagedCluster records
    pub clusters: Arc<dyn ClusterStore>,
    /// The provider's config resources
    pub configs: Arc<dyn ConfigResourceClient>,
    /// Secrets in the management cluster
    pub secrets: Arc<dyn SecretStore>,
    /// Upstream state builder
    pub upstream: Arc<dyn UpstreamSpecBuilder>,
    /// Direct and tunneled transports to downstream clusters
    pub transports: Arc<dyn TransportFactory>,
    /// Service account token issuance on downstream clusters
    pub issuer: Arc<dyn TokenIssuer>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
}

/// Outcome of making sure a cluster has a service account token secret
enum TokenStep {
    Stored(ManagedCluster),
    AwaitingAgent(ManagedCluster),
}

/// Reconciles the clusters of one hosted provider
pub struct ClusterReconciler<P: ProviderDriver> {
    driver: P,
    clusters: Arc<dyn ClusterStore>,
    configs: Arc<dyn ConfigResourceClient>,
    secrets: Arc<dyn SecretStore>,
    upstream: Arc<dyn UpstreamSpecBuilder>,
    access: EndpointAccessResolver,
    migrator: SecretMigrator,
    conditions: ConditionSetter,
    drift: SpecDriftConverger,
    config: Arc<OperatorConfig>,
}

impl<P: ProviderDriver> ClusterReconciler<P> {
    /// Create a reconciler for `driver`'s clusters
    pub fn new(driver: P, deps: ReconcilerDeps) -> Self {
        let config = deps.config;
        Self {
            access: EndpointAccessResolver::new(deps.transports, deps.issuer),
            migrator: SecretMigrator::new(deps.secrets.clone(), config.secret_namespace.clone()),
            conditions: ConditionSetter::new(deps.clusters.clone()),
            drift: SpecDriftConverger::new(
                deps.configs.clone(),
                deps.clusters.clone(),
                config.drift_watch_timeout,
                config.requeue_interval,
            ),
            driver,
            clusters: deps.clusters,
            configs: deps.configs,
            secrets: deps.secrets,
            upstream: deps.upstream,
            config,
        }
    }

    /// Do the next outstanding piece of work for `cluster`
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name_any(), provider = %self.driver.kind()))]
    pub async fn reconcile(&self, cluster: &ManagedCluster) -> Result<Reconciled, Error> {
        if cluster.is_deleting() || cluster.spec.provider_kind() != Some(self.driver.kind()) {
            return Ok(Reconciled::done(cluster.clone()));
        }

        let cluster = self.ensure_driver(cluster).await?;

        if !self.configs.is_registered().await? {
            return Err(Error::not_yet_available(format!(
                "{} is not established",
                self.driver.crd_name()
            )));
        }

        let (cluster, live) = match self.configs.get(&cluster.name_any()).await? {
            Some(live) => (cluster, live),
            None => self.create_config(cluster).await?,
        };

        let desired = self.desired_spec(&cluster)?;
        if desired != live_spec(&live) {
            info!("change detected, updating config resource");
            return self.drift.converge(&self.driver, &cluster, &live, desired).await;
        }

        let status = ConfigStatus::of(&live);
        let failure = self.driver.normalize_failure(&status.failure_message);
        match self.driver.classify_phase(&status.phase) {
            Phase::Creating => self.on_creating(cluster, &live, &failure).await,
            Phase::Active => self.on_active(cluster, &live, &status.failure_message).await,
            Phase::Updating => self.on_updating(cluster, &failure).await,
            Phase::Other(phase) => self.on_pending(cluster, &phase, &failure).await,
        }
    }

    fn requeue(&self, cluster: ManagedCluster) -> Reconciled {
        Reconciled::requeue(cluster, self.config.requeue_interval)
    }

    fn desired_spec(&self, cluster: &ManagedCluster) -> Result<Value, Error> {
        let provider = cluster.spec.provider.as_ref().ok_or_else(|| {
            Error::validation(format!("cluster {} has no provider config", cluster.name_any()))
        })?;
        Ok(provider.spec_value()?)
    }

    fn imported(cluster: &ManagedCluster) -> bool {
        cluster.spec.provider.as_ref().is_some_and(|p| p.imported())
    }

    async fn ensure_driver(&self, cluster: &ManagedCluster) -> Result<ManagedCluster, Error> {
        let driver = self.driver.kind().driver_name();
        let current = cluster.status.as_ref().and_then(|s| s.driver.as_deref());
        if current.is_some_and(|d| !d.is_empty()) {
            return Ok(cluster.clone());
        }

        let mut updated = cluster.clone();
        updated.status.get_or_insert_with(Default::default).driver = Some(driver.to_string());
        debug!(driver, "setting driver");
        self.clusters.update_status(&updated).await
    }

    async fn create_config(
        &self,
        cluster: ManagedCluster,
    ) -> Result<(ManagedCluster, DynamicObject), Error> {
        let cluster = self
            .conditions
            .set_unknown(&cluster, ConditionType::Waiting, WAITING_FOR_API)
            .await?;
        let obj = build_config_object(&self.driver, &cluster, &self.config.config_namespace)?;
        let created = self.configs.create(&obj).await?;
        info!(kind = %self.driver.api_resource().kind, "created config resource");
        Ok((cluster, created))
    }

    async fn set_upstream_spec(
        &self,
        cluster: ManagedCluster,
        live: &DynamicObject,
    ) -> Result<Reconciled, Error> {
        info!("setting initial upstream spec");
        let upstream = match self.upstream.build(&cluster, live).await {
            Ok(upstream) => upstream,
            Err(e) if e.is_not_found() => {
                debug!(error = %e, "upstream cluster not created yet");
                return Ok(self.requeue(cluster));
            }
            Err(e) => return Err(e),
        };

        let mut updated = cluster;
        updated.status.get_or_insert_with(Default::default).upstream_spec = Some(upstream);
        let stored = self.clusters.update_status(&updated).await?;
        Ok(Reconciled::done(stored))
    }

    async fn on_creating(
        &self,
        cluster: ManagedCluster,
        live: &DynamicObject,
        failure: &str,
    ) -> Result<Reconciled, Error> {
        if cluster.status_or_default().upstream_spec.is_none() {
            return self.set_upstream_spec(cluster, live).await;
        }

        let cluster = self
            .conditions
            .set_failed_or_unknown(&cluster, ConditionType::Provisioned, failure)
            .await?;
        if failure.is_empty() {
            info!("waiting for cluster to finish creating");
        } else {
            info!(failure, "waiting for create failure to be resolved");
        }
        Ok(self.requeue(cluster))
    }

    async fn on_active(
        &self,
        cluster: ManagedCluster,
        live: &DynamicObject,
        raw_failure: &str,
    ) -> Result<Reconciled, Error> {
        let status = cluster.status_or_default();
        let Some(upstream) = status.upstream_spec.as_ref() else {
            // imported clusters, or a creation whose "creating" phase was never seen
            return self.set_upstream_spec(cluster, live).await;
        };

        let pending_unknown = status
            .condition(ConditionType::Pending)
            .is_some_and(|c| c.status == ConditionStatus::Unknown);
        if Self::imported(&cluster) && pending_unknown {
            let stored = self
                .conditions
                .set_true(&cluster, ConditionType::Pending, "")
                .await?;
            return Ok(Reconciled::done(stored));
        }

        let cluster = self
            .conditions
            .set_true(&cluster, ConditionType::Provisioned, "")
            .await?;

        if status.endpoint().is_none() {
            return self.record_ca_and_endpoint(cluster).await;
        }

        if status.private_requires_tunnel.is_none() && self.driver.is_private_endpoint(upstream) {
            return self.resolve_access(cluster).await;
        }

        let cluster = if status.token_secret().is_none() {
            match self.ensure_token(cluster).await? {
                TokenStep::Stored(cluster) => cluster,
                TokenStep::AwaitingAgent(cluster) => return Ok(self.requeue(cluster)),
            }
        } else {
            cluster
        };

        let cluster = record_applied_spec(self.clusters.as_ref(), &cluster).await?;

        if let Some(message) = self.driver.credential_failure(raw_failure) {
            let stored = self
                .conditions
                .set_false(&cluster, ConditionType::Updated, &message)
                .await?;
            return Ok(Reconciled::done(stored));
        }

        let stored = self
            .conditions
            .set_true(&cluster, ConditionType::Updated, "")
            .await?;
        Ok(Reconciled::done(stored))
    }

    async fn on_updating(&self, cluster: ManagedCluster, failure: &str) -> Result<Reconciled, Error> {
        let cluster = self
            .conditions
            .set_true(&cluster, ConditionType::Provisioned, "")
            .await?;
        let cluster = self
            .conditions
            .set_failed_or_unknown(&cluster, ConditionType::Updated, failure)
            .await?;
        if failure.is_empty() {
            info!("waiting for cluster to update");
        } else {
            info!(failure, "waiting for update failure to be resolved");
        }
        Ok(self.requeue(cluster))
    }

    async fn on_pending(
        &self,
        cluster: ManagedCluster,
        phase: &str,
        failure: &str,
    ) -> Result<Reconciled, Error> {
        let cluster = if Self::imported(&cluster) {
            info!(phase, "waiting for cluster import to start");
            self.conditions
                .set_unknown(&cluster, ConditionType::Pending, "")
                .await?
        } else {
            info!(phase, "waiting for cluster create to start");
            cluster
        };
        let cluster = self
            .conditions
            .set_failed_or_unknown(&cluster, ConditionType::Provisioned, failure)
            .await?;
        Ok(self.requeue(cluster))
    }

    async fn record_ca_and_endpoint(&self, cluster: ManagedCluster) -> Result<Reconciled, Error> {
        let captured = capture_ca_and_endpoint(
            self.secrets.as_ref(),
            &self.config.config_namespace,
            &cluster.name_any(),
            &self.config.endpoint_backoff,
        )
        .await?;

        let mut updated = cluster;
        let status = updated.status.get_or_insert_with(Default::default);
        status.api_endpoint = Some(captured.api_endpoint);
        status.ca_cert = Some(captured.ca_cert);
        let stored = self.clusters.update_status(&updated).await?;
        info!("recorded API endpoint and CA");
        Ok(Reconciled::done(stored))
    }

    async fn resolve_access(&self, cluster: ManagedCluster) -> Result<Reconciled, Error> {
        let verdict = self
            .access
            .resolve(&cluster, self.driver.tunnel_classifier())
            .await?;
        let requires_tunnel = verdict.requires_tunnel();

        let stored = match verdict {
            AccessVerdict::Direct { token } if !token.is_empty() => {
                self.store_token(&cluster, &token, Some(requires_tunnel)).await?
            }
            _ => {
                let mut updated = cluster;
                updated
                    .status
                    .get_or_insert_with(Default::default)
                    .private_requires_tunnel = Some(requires_tunnel);
                self.clusters.update_status(&updated).await?
            }
        };
        info!(requires_tunnel, "determined private endpoint access");
        Ok(Reconciled::done(stored))
    }

    async fn ensure_token(&self, cluster: ManagedCluster) -> Result<TokenStep, Error> {
        let status = cluster.status_or_default();
        if status
            .service_account_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
        {
            let migrated = self
                .migrator
                .migrate_service_account_token(&cluster, self.clusters.as_ref())
                .await?;
            return Ok(TokenStep::Stored(migrated));
        }

        match self.access.issue_token(&cluster).await {
            Ok(token) => Ok(TokenStep::Stored(self.store_token(&cluster, &token, None).await?)),
            Err(Error::AgentDisconnected(_)) => {
                info!("private endpoint requires the cluster agent, waiting for it to connect");
                let cluster = self
                    .conditions
                    .set_unknown(&cluster, ConditionType::Waiting, WAITING_FOR_AGENT)
                    .await?;
                Ok(TokenStep::AwaitingAgent(cluster))
            }
            Err(e) => {
                self.conditions
                    .set_false(
                        &cluster,
                        ConditionType::Waiting,
                        &format!("failed to communicate with cluster: {}", e),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Store `token` in the cluster's credential secret and reference it
    ///
    /// A secret created here is removed again if the record update fails.
    async fn store_token(
        &self,
        cluster: &ManagedCluster,
        token: &str,
        requires_tunnel: Option<bool>,
    ) -> Result<ManagedCluster, Error> {
        let existing = cluster
            .status
            .as_ref()
            .and_then(|s| s.token_secret())
            .map(str::to_string);
        let secret = self
            .migrator
            .create_or_update_service_account_token(
                existing.as_deref(),
                token,
                Some(cluster.owner_reference()?),
            )
            .await?
            .ok_or_else(|| Error::internal("service account token secret can't be empty"))?;

        let mut updated = cluster.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.service_account_token_secret = Some(secret.name_any());
        status.service_account_token = None;
        if requires_tunnel.is_some() {
            status.private_requires_tunnel = requires_tunnel;
        }

        match self.clusters.update_status(&updated).await {
            Ok(stored) => {
                info!(secret = %secret.name_any(), "stored service account token");
                Ok(stored)
            }
            Err(e) => {
                if existing.is_none() {
                    warn!(secret = %secret.name_any(), error = %e, "removing token secret after failed update");
                    self.migrator.cleanup_known(std::slice::from_ref(&secret)).await;
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<P: ProviderDriver> ReconcileCluster for ClusterReconciler<P> {
    fn kind(&self) -> ProviderKind {
        self.driver.kind()
    }

    async fn reconcile(&self, cluster: &ManagedCluster) -> Result<Reconciled, Error> {
        ClusterReconciler::reconcile(self, cluster).await
    }
}
