//! Operator configuration
//!
//! Populated from the command line (see `main.rs`) and shared read-only by all
//! reconcilers through the controller context.

use std::time::Duration;

use crate::crd::ProviderKind;
use crate::retry::{BackoffSchedule, RetryConfig};

/// Namespace holding the provider config resources and driver-published secrets
pub const DEFAULT_CONFIG_NAMESPACE: &str = "hosted-global-data";

/// Namespace holding credential secrets created by this operator
pub const DEFAULT_SECRET_NAMESPACE: &str = "hosted-global-data";

/// Namespace where cluster agents renew their presence leases
pub const DEFAULT_AGENT_LEASE_NAMESPACE: &str = "hosted-agents";

/// Runtime settings for the reconcilers
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace of provider config resources and driver-published CA secrets
    pub config_namespace: String,
    /// Namespace of credential secrets
    pub secret_namespace: String,
    /// Delay before re-running a reconcile that still has work to do
    pub requeue_interval: Duration,
    /// How long to wait for the provider to acknowledge a spec update
    pub drift_watch_timeout: Duration,
    /// Connect timeout for direct access probes
    pub probe_connect_timeout: Duration,
    /// Read timeout for direct access probes
    pub probe_read_timeout: Duration,
    /// Schedule for waiting on the driver-published CA/endpoint secret
    pub endpoint_backoff: BackoffSchedule,
    /// Retry policy for reading back a freshly created token secret
    pub token_retry: RetryConfig,
    /// Proxy URL for tunneled connections, keyed by cluster name at dial time
    pub tunnel_proxy_url: Option<String>,
    /// Namespace of the agent presence leases feeding the tunnel sessions
    pub agent_lease_namespace: String,
    /// Providers whose clusters this operator reconciles
    pub enabled_providers: Vec<ProviderKind>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            config_namespace: DEFAULT_CONFIG_NAMESPACE.to_string(),
            secret_namespace: DEFAULT_SECRET_NAMESPACE.to_string(),
            requeue_interval: Duration::from_secs(5),
            drift_watch_timeout: Duration::from_secs(10),
            probe_connect_timeout: Duration::from_secs(30),
            probe_read_timeout: Duration::from_secs(30),
            endpoint_backoff: BackoffSchedule::default(),
            token_retry: RetryConfig::with_max_attempts(10),
            tunnel_proxy_url: None,
            agent_lease_namespace: DEFAULT_AGENT_LEASE_NAMESPACE.to_string(),
            enabled_providers: ProviderKind::ALL.to_vec(),
        }
    }
}

impl OperatorConfig {
    /// Whether clusters of this provider are reconciled
    pub fn is_enabled(&self, kind: ProviderKind) -> bool {
        self.enabled_providers.contains(&kind)
    }
}
