//! Agent presence from coordination Leases
//!
//! Each cluster agent holds a Lease named after its cluster in the agent
//! lease namespace and renews it while its tunnel is up. A lease whose
//! renew time plus duration lies in the future is a live tunnel session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use super::TunnelSessions;

/// Keeps [`TunnelSessions`] in step with agent leases
pub struct AgentLeaseWatcher {
    client: Client,
    namespace: String,
    sessions: Arc<TunnelSessions>,
}

impl AgentLeaseWatcher {
    /// Create a watcher over the leases in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>, sessions: Arc<TunnelSessions>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            sessions,
        }
    }

    /// Watch agent leases until the stream ends
    pub async fn run(self) {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);

        info!(namespace = %self.namespace, "watching agent leases");
        while let Some(event) = stream.next().await {
            handle_lease_event(&self.sessions, event, Utc::now()).await;
        }
        warn!(namespace = %self.namespace, "agent lease watch ended");
    }
}

async fn handle_lease_event(
    sessions: &TunnelSessions,
    event: Result<Event<Lease>, watcher::Error>,
    now: DateTime<Utc>,
) {
    match event {
        Ok(Event::Apply(lease)) | Ok(Event::InitApply(lease)) => {
            observe_lease(sessions, &lease, now);
        }
        Ok(Event::Delete(lease)) => sessions.unregister(&lease.name_any()),
        Ok(Event::Init) | Ok(Event::InitDone) => {
            debug!("agent lease watcher initialized");
        }
        Err(e) => {
            warn!(error = %e, "agent lease watcher error, will retry");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

/// When `lease` stops vouching for its agent, if it carries a renewal at all
pub fn lease_expiry(lease: &Lease) -> Option<DateTime<Utc>> {
    let spec = lease.spec.as_ref()?;
    let renewed = spec.renew_time.as_ref()?.0;
    let duration = spec.lease_duration_seconds?;
    Some(renewed + chrono::Duration::seconds(i64::from(duration)))
}

/// Register or drop the session `lease` describes, as of `now`
pub fn observe_lease(sessions: &TunnelSessions, lease: &Lease, now: DateTime<Utc>) {
    let cluster = lease.name_any();
    match lease_expiry(lease) {
        Some(expiry) if expiry > now => {
            let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.clone());
            sessions.register_until(cluster, holder, Some(expiry));
        }
        _ => sessions.unregister(&cluster),
    }
}
