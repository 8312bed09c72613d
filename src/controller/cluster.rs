//! kube-runtime entry points for ManagedCluster reconciliation
//!
//! The runtime controller calls [`reconcile`] for every ManagedCluster
//! change. It dispatches on the provider tag to the owning provider's
//! [`ReconcileCluster`] and turns the outcome into an [`Action`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, instrument};

use super::reconciler::{ClusterReconciler, ReconcileCluster, ReconcilerDeps};
use crate::client::{
    ClusterStore, ConfigResourceClient, KubeClusterStore, KubeConfigResourceClient,
    KubeSecretStore, SecretStore,
};
use crate::config::OperatorConfig;
use crate::crd::{ManagedCluster, ProviderKind};
use crate::endpoint::{
    KubeTokenIssuer, SessionTransportFactory, TokenIssuer, TransportFactory, TunnelSessions,
};
use crate::provider::{
    AksDriver, AlibabaDriver, EksDriver, GkeDriver, ObservedSpecBuilder, ProviderDriver,
    UpstreamSpecBuilder,
};
use crate::Error;

/// Requeue delay after an optimistic concurrency conflict
pub const CONFLICT_RETRY: Duration = Duration::from_secs(1);

/// Requeue delay while a dependency is not installed or ready
pub const NOT_YET_AVAILABLE_RETRY: Duration = Duration::from_secs(10);

/// Requeue delay after an invariant violation; retrying rarely helps
pub const INVARIANT_RETRY: Duration = Duration::from_secs(300);

/// Controller context shared by every reconcile call
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, config)
///     .sessions(sessions)
///     .build();
/// ```
pub struct Context {
    /// Reconciler per enabled provider
    pub reconcilers: BTreeMap<ProviderKind, Arc<dyn ReconcileCluster>>,
    /// Connected cluster agents
    pub sessions: Arc<TunnelSessions>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: OperatorConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Reconciler owning clusters of `kind`, if that provider is enabled
    pub fn reconciler(&self, kind: ProviderKind) -> Option<&Arc<dyn ReconcileCluster>> {
        self.reconcilers.get(&kind)
    }

    /// Create a context for testing with the given reconcilers
    #[cfg(test)]
    pub fn for_testing(reconcilers: Vec<Arc<dyn ReconcileCluster>>) -> Self {
        Self {
            reconcilers: reconcilers.into_iter().map(|r| (r.kind(), r)).collect(),
            sessions: Arc::new(TunnelSessions::new()),
            config: Arc::new(OperatorConfig::default()),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every store defaults to the kube-backed implementation; the overrides
/// exist for wiring in alternatives.
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    clusters: Option<Arc<dyn ClusterStore>>,
    secrets: Option<Arc<dyn SecretStore>>,
    upstream: Option<Arc<dyn UpstreamSpecBuilder>>,
    issuer: Option<Arc<dyn TokenIssuer>>,
    sessions: Option<Arc<TunnelSessions>>,
}

impl ContextBuilder {
    fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            clusters: None,
            secrets: None,
            upstream: None,
            issuer: None,
            sessions: None,
        }
    }

    /// Share an existing tunnel session registry
    pub fn sessions(mut self, sessions: Arc<TunnelSessions>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Override the ManagedCluster store
    pub fn cluster_store(mut self, clusters: Arc<dyn ClusterStore>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    /// Override the secret store
    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Override the upstream spec builder
    pub fn upstream_builder(mut self, upstream: Arc<dyn UpstreamSpecBuilder>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Override the token issuer
    pub fn token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Build the Context, with one reconciler per enabled provider
    pub fn build(self) -> Context {
        let config = Arc::new(self.config);
        let clusters = self
            .clusters
            .unwrap_or_else(|| Arc::new(KubeClusterStore::new(self.client.clone())));
        let secrets = self
            .secrets
            .unwrap_or_else(|| Arc::new(KubeSecretStore::new(self.client.clone())));
        let upstream = self
            .upstream
            .unwrap_or_else(|| Arc::new(ObservedSpecBuilder));
        let issuer = self.issuer.unwrap_or_else(|| {
            Arc::new(KubeTokenIssuer::new(
                secrets.clone(),
                config.secret_namespace.clone(),
                config.token_retry.clone(),
            ))
        });
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(TunnelSessions::new()));
        let transports: Arc<dyn TransportFactory> = Arc::new(SessionTransportFactory::new(
            sessions.clone(),
            config.probe_connect_timeout,
            config.probe_read_timeout,
            config.tunnel_proxy_url.clone(),
        ));

        let deps = |configs: Arc<dyn ConfigResourceClient>| ReconcilerDeps {
            clusters: clusters.clone(),
            configs,
            secrets: secrets.clone(),
            upstream: upstream.clone(),
            transports: transports.clone(),
            issuer: issuer.clone(),
            config: config.clone(),
        };
        let client = &self.client;
        let namespace = config.config_namespace.as_str();

        let reconcilers = ProviderKind::ALL
            .iter()
            .filter(|kind| config.is_enabled(**kind))
            .map(|kind| {
                let reconciler = match kind {
                    ProviderKind::Aks => provider_reconciler(AksDriver, client, namespace, &deps),
                    ProviderKind::Eks => provider_reconciler(EksDriver, client, namespace, &deps),
                    ProviderKind::Gke => provider_reconciler(GkeDriver, client, namespace, &deps),
                    ProviderKind::Alibaba => {
                        provider_reconciler(AlibabaDriver, client, namespace, &deps)
                    }
                };
                (*kind, reconciler)
            })
            .collect();

        Context {
            reconcilers,
            sessions,
            config,
        }
    }
}

fn provider_reconciler<P: ProviderDriver>(
    driver: P,
    client: &Client,
    namespace: &str,
    deps: &impl Fn(Arc<dyn ConfigResourceClient>) -> ReconcilerDeps,
) -> Arc<dyn ReconcileCluster> {
    let configs: Arc<dyn ConfigResourceClient> = Arc::new(KubeConfigResourceClient::new(
        client.clone(),
        driver.api_resource(),
        driver.crd_name(),
        namespace,
    ));
    Arc::new(ClusterReconciler::new(driver, deps(configs)))
}

/// Reconcile a ManagedCluster
///
/// Records without a provider config, or whose provider is not enabled,
/// are ignored until they change.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(kind) = cluster.spec.provider_kind() else {
        debug!("no hosted provider config");
        return Ok(Action::await_change());
    };
    let Some(reconciler) = ctx.reconciler(kind) else {
        debug!(provider = %kind, "provider not enabled");
        return Ok(Action::await_change());
    };

    let outcome = reconciler.reconcile(&cluster).await?;
    Ok(outcome
        .requeue_after
        .map(Action::requeue)
        .unwrap_or_else(Action::await_change))
}

/// Requeue policy for failed reconciles
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(retry_delay(error, ctx.config.requeue_interval))
}

/// Delay before retrying after `error`
pub fn retry_delay(error: &Error, default: Duration) -> Duration {
    match error {
        Error::Conflict { .. } => CONFLICT_RETRY,
        Error::NotYetAvailable(_) => NOT_YET_AVAILABLE_RETRY,
        Error::InvariantViolation(_) => INVARIANT_RETRY,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{MockReconcileCluster, Reconciled};
    use crate::crd::{AksConfigSpec, GkeConfigSpec, ManagedClusterSpec, ProviderConfig};

    fn cluster(provider: Option<ProviderConfig>) -> Arc<ManagedCluster> {
        Arc::new(ManagedCluster::new(
            "c1",
            ManagedClusterSpec {
                display_name: None,
                provider,
            },
        ))
    }

    fn aks() -> Option<ProviderConfig> {
        Some(ProviderConfig::AksConfig(AksConfigSpec::default()))
    }

    fn mock_reconciler(
        requeue_after: Option<Duration>,
    ) -> Arc<dyn ReconcileCluster> {
        let mut mock = MockReconcileCluster::new();
        mock.expect_kind().return_const(ProviderKind::Aks);
        mock.expect_reconcile().returning(move |c| {
            Ok(Reconciled {
                cluster: c.clone(),
                requeue_after,
            })
        });
        Arc::new(mock)
    }

    /// Story: work remaining becomes a delayed requeue
    #[tokio::test]
    async fn story_requeue_after_maps_to_action() {
        let ctx = Arc::new(Context::for_testing(vec![mock_reconciler(Some(
            Duration::from_secs(5),
        ))]));
        let action = reconcile(cluster(aks()), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_converged_cluster_awaits_change() {
        let ctx = Arc::new(Context::for_testing(vec![mock_reconciler(None)]));
        let action = reconcile(cluster(aks()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_disabled_provider_is_ignored() {
        let mut mock = MockReconcileCluster::new();
        mock.expect_kind().return_const(ProviderKind::Aks);
        mock.expect_reconcile().never();
        let ctx = Arc::new(Context::for_testing(vec![Arc::new(mock)]));

        let gke = Some(ProviderConfig::GkeConfig(GkeConfigSpec::default()));
        assert_eq!(
            reconcile(cluster(gke), ctx.clone()).await.unwrap(),
            Action::await_change()
        );
        assert_eq!(
            reconcile(cluster(None), ctx).await.unwrap(),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn test_reconciler_errors_propagate() {
        let mut mock = MockReconcileCluster::new();
        mock.expect_kind().return_const(ProviderKind::Aks);
        mock.expect_reconcile()
            .returning(|_| Err(Error::not_yet_available("aksclusterconfigs.aks.cattle.io")));
        let ctx = Arc::new(Context::for_testing(vec![Arc::new(mock)]));

        let err = reconcile(cluster(aks()), ctx).await.unwrap_err();
        assert!(matches!(err, Error::NotYetAvailable(_)));
    }

    mod error_policy {
        use super::*;

        #[test]
        fn test_retry_delays_by_error() {
            let default = Duration::from_secs(5);
            assert_eq!(
                retry_delay(&Error::conflict("ManagedCluster", "c1"), default),
                CONFLICT_RETRY
            );
            assert_eq!(
                retry_delay(&Error::not_yet_available("crd"), default),
                NOT_YET_AVAILABLE_RETRY
            );
            assert_eq!(
                retry_delay(&Error::invariant("no uid"), default),
                INVARIANT_RETRY
            );
            assert_eq!(
                retry_delay(&Error::AgentDisconnected("c1".to_string()), default),
                default
            );
        }

        #[test]
        fn test_policy_uses_configured_default() {
            let ctx = Arc::new(Context::for_testing(vec![]));
            let action = super::super::error_policy(
                cluster(aks()),
                &Error::internal("boom"),
                ctx,
            );
            assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        }
    }
}
