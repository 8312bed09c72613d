//! Transports for reaching downstream clusters and the tunnel session registry

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// How to connect to a downstream cluster's API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Dial the API endpoint directly from the management cluster
    Direct {
        /// TCP connect timeout
        connect_timeout: Duration,
        /// Per-request read timeout
        read_timeout: Duration,
    },
    /// Go through the cluster agent's tunnel
    Tunnel {
        /// Cluster whose tunnel session carries the traffic
        cluster: String,
        /// Local proxy fronting the tunnel sessions, if any
        proxy_url: Option<String>,
    },
}

/// Produces transports; tunneled ones only when the agent is connected
#[cfg_attr(test, automock)]
pub trait TransportFactory: Send + Sync {
    /// A direct transport
    fn direct(&self) -> Transport;

    /// A tunneled transport for `cluster`
    ///
    /// Fails with [`Error::AgentDisconnected`] when no session exists.
    fn tunnel(&self, cluster: &str) -> Result<Transport, Error>;
}

/// A connected cluster agent
#[derive(Clone, Debug)]
pub struct TunnelSession {
    /// Cluster the agent runs in
    pub cluster: String,
    /// Remote address the agent connected from
    pub peer: Option<String>,
    /// When the session was established
    pub connected_at: DateTime<Utc>,
    /// The session counts as gone after this instant unless renewed
    pub expires_at: Option<DateTime<Utc>>,
}

impl TunnelSession {
    /// Whether the session is still valid at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// Registry of connected agent tunnel sessions, keyed by cluster name
///
/// Fed by [`crate::endpoint::AgentLeaseWatcher`] from the leases agents
/// renew; read by reconcilers through [`SessionTransportFactory`].
#[derive(Default)]
pub struct TunnelSessions {
    sessions: DashMap<String, TunnelSession>,
}

impl TunnelSessions {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connected agent, replacing any previous session
    pub fn register(&self, cluster: impl Into<String>, peer: Option<String>) {
        self.register_until(cluster, peer, None);
    }

    /// Record a connected agent whose session lapses at `expires_at`
    ///
    /// Renewing an existing session keeps its original connect time.
    pub fn register_until(
        &self,
        cluster: impl Into<String>,
        peer: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let cluster = cluster.into();
        let connected_at = match self.sessions.get(&cluster) {
            Some(existing) if existing.is_live(Utc::now()) => existing.connected_at,
            _ => {
                info!(cluster = %cluster, peer = ?peer, "tunnel session connected");
                Utc::now()
            }
        };
        self.sessions.insert(
            cluster.clone(),
            TunnelSession {
                cluster,
                peer,
                connected_at,
                expires_at,
            },
        );
    }

    /// Forget a cluster's session
    pub fn unregister(&self, cluster: &str) {
        if self.sessions.remove(cluster).is_some() {
            info!(cluster = %cluster, "tunnel session disconnected");
        }
    }

    /// Whether a live agent session exists for `cluster`
    pub fn is_connected(&self, cluster: &str) -> bool {
        self.sessions
            .get(cluster)
            .is_some_and(|s| s.is_live(Utc::now()))
    }

    /// Session details for `cluster`
    pub fn get(&self, cluster: &str) -> Option<TunnelSession> {
        self.sessions.get(cluster).map(|s| s.value().clone())
    }

    /// Number of connected sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no agent is connected
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// [`TransportFactory`] consulting a [`TunnelSessions`] registry
pub struct SessionTransportFactory {
    sessions: Arc<TunnelSessions>,
    connect_timeout: Duration,
    read_timeout: Duration,
    proxy_url: Option<String>,
}

impl SessionTransportFactory {
    /// Create a factory; direct transports use the given timeouts
    pub fn new(
        sessions: Arc<TunnelSessions>,
        connect_timeout: Duration,
        read_timeout: Duration,
        proxy_url: Option<String>,
    ) -> Self {
        Self {
            sessions,
            connect_timeout,
            read_timeout,
            proxy_url,
        }
    }
}

impl TransportFactory for SessionTransportFactory {
    fn direct(&self) -> Transport {
        Transport::Direct {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        }
    }

    fn tunnel(&self, cluster: &str) -> Result<Transport, Error> {
        if !self.sessions.is_connected(cluster) {
            debug!(cluster = %cluster, "no tunnel session");
            return Err(Error::AgentDisconnected(cluster.to_string()));
        }
        Ok(Transport::Tunnel {
            cluster: cluster.to_string(),
            proxy_url: self.proxy_url.clone(),
        })
    }
}
