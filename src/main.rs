//! Hosted operator - keeps ManagedCluster records in sync with hosted providers

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use hosted_operator::config::{
    OperatorConfig, DEFAULT_AGENT_LEASE_NAMESPACE, DEFAULT_CONFIG_NAMESPACE, DEFAULT_SECRET_NAMESPACE,
};
use hosted_operator::controller::{error_policy, reconcile, Context};
use hosted_operator::crd::{ManagedCluster, ProviderKind};
use hosted_operator::endpoint::AgentLeaseWatcher;
use hosted_operator::retry::{BackoffSchedule, RetryConfig};
use hosted_operator::telemetry::init_tracing;

/// Hosted operator - reconciles AKS, EKS, GKE and Alibaba ACK clusters
#[derive(Parser, Debug)]
#[command(name = "hosted-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the ManagedCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "HOSTED_OPERATOR_JSON_LOGS", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Namespace of the provider config resources
    #[arg(long, env = "CONFIG_NAMESPACE", default_value = DEFAULT_CONFIG_NAMESPACE)]
    config_namespace: String,

    /// Namespace of credential secrets created by the operator
    #[arg(long, env = "SECRET_NAMESPACE", default_value = DEFAULT_SECRET_NAMESPACE)]
    secret_namespace: String,

    /// Seconds before re-running a reconcile that still has work to do
    #[arg(long, env = "REQUEUE_SECS", default_value = "5")]
    requeue_secs: u64,

    /// Seconds to wait for a provider to acknowledge a spec update
    #[arg(long, env = "DRIFT_WATCH_TIMEOUT_SECS", default_value = "10")]
    drift_watch_timeout_secs: u64,

    /// Connect timeout in seconds for direct access probes
    #[arg(long, env = "PROBE_CONNECT_TIMEOUT_SECS", default_value = "30")]
    probe_connect_timeout_secs: u64,

    /// Read timeout in seconds for direct access probes
    #[arg(long, env = "PROBE_READ_TIMEOUT_SECS", default_value = "30")]
    probe_read_timeout_secs: u64,

    /// Number of checks for the driver-published CA/endpoint secret
    #[arg(long, env = "ENDPOINT_BACKOFF_STEPS", default_value = "6")]
    endpoint_backoff_steps: u32,

    /// Attempts at reading back a freshly created token secret
    #[arg(long, env = "TOKEN_RETRY_ATTEMPTS", default_value = "10")]
    token_retry_attempts: u32,

    /// Proxy URL for clusters reached through their agent tunnel
    #[arg(long, env = "TUNNEL_PROXY_URL")]
    tunnel_proxy_url: Option<String>,

    /// Namespace where cluster agents renew their presence leases
    #[arg(long, env = "AGENT_LEASE_NAMESPACE", default_value = DEFAULT_AGENT_LEASE_NAMESPACE)]
    agent_lease_namespace: String,

    /// Providers to reconcile
    #[arg(
        long,
        env = "ENABLED_PROVIDERS",
        value_delimiter = ',',
        default_value = "aks,eks,gke,alibaba"
    )]
    providers: Vec<ProviderKind>,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self::parse_from(["controller"])
    }
}

impl ControllerArgs {
    fn into_config(self) -> OperatorConfig {
        OperatorConfig {
            config_namespace: self.config_namespace,
            secret_namespace: self.secret_namespace,
            requeue_interval: Duration::from_secs(self.requeue_secs),
            drift_watch_timeout: Duration::from_secs(self.drift_watch_timeout_secs),
            probe_connect_timeout: Duration::from_secs(self.probe_connect_timeout_secs),
            probe_read_timeout: Duration::from_secs(self.probe_read_timeout_secs),
            endpoint_backoff: BackoffSchedule {
                steps: self.endpoint_backoff_steps,
                ..BackoffSchedule::default()
            },
            token_retry: RetryConfig::with_max_attempts(self.token_retry_attempts),
            tunnel_proxy_url: self.tunnel_proxy_url,
            agent_lease_namespace: self.agent_lease_namespace,
            enabled_providers: self.providers,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ManagedCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.json_logs)?;

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };
    run_controller(args.into_config()).await
}

/// Install the ManagedCluster CRD, kept current on every start
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("hosted-operator").force();

    tracing::info!("Installing ManagedCluster CRD...");
    crds.patch(
        "managedclusters.management.hosted.dev",
        &params,
        &Patch::Apply(&ManagedCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ManagedCluster CRD: {}", e))?;
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(
        providers = ?config.enabled_providers,
        config_namespace = %config.config_namespace,
        "hosted operator starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let lease_namespace = config.agent_lease_namespace.clone();
    let ctx = Arc::new(Context::builder(client.clone(), config).build());
    let agents = tokio::spawn(
        AgentLeaseWatcher::new(client.clone(), lease_namespace, ctx.sessions.clone()).run(),
    );
    let clusters: Api<ManagedCluster> = Api::all(client);

    Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "cluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "cluster reconciliation error");
                }
            }
        })
        .await;

    agents.abort();
    tracing::info!("hosted operator shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_operator_config() {
        let config = ControllerArgs::default().into_config();
        let defaults = OperatorConfig::default();
        assert_eq!(config.requeue_interval, defaults.requeue_interval);
        assert_eq!(config.drift_watch_timeout, defaults.drift_watch_timeout);
        assert_eq!(config.probe_connect_timeout, defaults.probe_connect_timeout);
        assert_eq!(config.endpoint_backoff, defaults.endpoint_backoff);
        assert_eq!(config.enabled_providers, ProviderKind::ALL.to_vec());
        assert_eq!(config.agent_lease_namespace, defaults.agent_lease_namespace);
    }

    #[test]
    fn test_provider_list_parses() {
        let cli = Cli::parse_from([
            "hosted-operator",
            "controller",
            "--providers",
            "eks,ali",
            "--tunnel-proxy-url",
            "http://tunnel.local:8080",
        ]);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller command");
        };
        let config = args.into_config();
        assert_eq!(
            config.enabled_providers,
            vec![ProviderKind::Eks, ProviderKind::Alibaba]
        );
        assert_eq!(config.tunnel_proxy_url.as_deref(), Some("http://tunnel.local:8080"));
    }
}
