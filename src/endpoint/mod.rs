//! Endpoint reachability: direct vs. tunneled access to a hosted cluster
//!
//! A private-only API endpoint may still be reachable from the management
//! cluster (peered networks, VPN). Whether it is can only be learned by trying:
//! the [`EndpointAccessResolver`] issues a service account token over a direct
//! transport and classifies the outcome with the provider's
//! [`TunnelClassifier`].

mod agents;
mod capture;
mod issuer;
mod transport;

pub use agents::{lease_expiry, observe_lease, AgentLeaseWatcher};
pub use capture::{capture_ca_and_endpoint, CaEndpoint};
pub use issuer::{KubeTokenIssuer, TokenIssuer};
pub use transport::{
    SessionTransportFactory, Transport, TransportFactory, TunnelSession, TunnelSessions,
};

#[cfg(test)]
pub use issuer::MockTokenIssuer;
#[cfg(test)]
pub use transport::MockTransportFactory;

use std::sync::Arc;

use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::crd::ManagedCluster;
use crate::Error;

/// How a call against a downstream cluster failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeErrorKind {
    /// Name resolution failed
    Dns {
        /// The resolver reported a transient failure
        temporary: bool,
    },
    /// TCP connection was refused or reset while connecting
    Connect,
    /// TCP connection could not be established in time
    ConnectTimeout,
    /// The request timed out after connecting
    Timeout,
    /// Anything else (TLS, HTTP status, missing token, ...)
    Other,
}

/// Failure talking to a downstream cluster
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProbeError {
    /// Classified failure
    pub kind: ProbeErrorKind,
    /// Human-readable description
    pub message: String,
}

impl ProbeError {
    /// Create a probe error
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Provider policy for deciding that a failed direct probe means "must tunnel"
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelClassifier {
    /// Non-temporary DNS failure or client timeout (AKS, EKS, Alibaba)
    ResolutionOrTimeout,
    /// Any failure to establish the TCP connection (GKE)
    AnyDialFailure,
}

impl TunnelClassifier {
    /// Whether `err` shows the endpoint is unreachable without the tunnel
    pub fn requires_tunnel(&self, err: &ProbeError) -> bool {
        match self {
            Self::ResolutionOrTimeout => matches!(
                err.kind,
                ProbeErrorKind::Dns { temporary: false }
                    | ProbeErrorKind::ConnectTimeout
                    | ProbeErrorKind::Timeout
            ),
            Self::AnyDialFailure => matches!(
                err.kind,
                ProbeErrorKind::Dns { .. }
                    | ProbeErrorKind::Connect
                    | ProbeErrorKind::ConnectTimeout
            ),
        }
    }
}

/// Outcome of a reachability probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessVerdict {
    /// Reachable directly; the token obtained while probing
    Direct {
        /// Service account token issued over the direct transport
        token: String,
    },
    /// Only reachable through the agent tunnel
    TunnelRequired,
}

impl AccessVerdict {
    /// Value to record in `status.privateRequiresTunnel`
    pub fn requires_tunnel(&self) -> bool {
        matches!(self, Self::TunnelRequired)
    }
}

/// Issues tokens over the right transport and probes direct reachability
#[derive(Clone)]
pub struct EndpointAccessResolver {
    transports: Arc<dyn TransportFactory>,
    issuer: Arc<dyn TokenIssuer>,
}

impl EndpointAccessResolver {
    /// Create a resolver
    pub fn new(transports: Arc<dyn TransportFactory>, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self { transports, issuer }
    }

    /// Probe whether `cluster` can be reached without the tunnel
    ///
    /// Errors that `classifier` does not recognise are returned unchanged;
    /// nothing should be recorded for them.
    pub async fn resolve(
        &self,
        cluster: &ManagedCluster,
        classifier: TunnelClassifier,
    ) -> Result<AccessVerdict, Error> {
        let name = cluster.name_any();
        let transport = self.transports.direct();

        match self.issuer.issue_token(cluster, &transport).await {
            Ok(token) => {
                info!(cluster = %name, "private endpoint is reachable directly");
                Ok(AccessVerdict::Direct { token })
            }
            Err(Error::Probe(probe)) if classifier.requires_tunnel(&probe) => {
                info!(
                    cluster = %name,
                    error = %probe,
                    "private endpoint unreachable directly, tunnel required"
                );
                Ok(AccessVerdict::TunnelRequired)
            }
            Err(e) => {
                debug!(cluster = %name, error = %e, "could not determine endpoint access");
                Err(e)
            }
        }
    }

    /// Issue a service account token, tunneling when the record says so
    pub async fn issue_token(&self, cluster: &ManagedCluster) -> Result<String, Error> {
        let tunneled = cluster
            .status
            .as_ref()
            .and_then(|s| s.private_requires_tunnel)
            .unwrap_or(false);

        let transport = if tunneled {
            self.transports.tunnel(&cluster.name_any())?
        } else {
            self.transports.direct()
        };

        self.issuer.issue_token(cluster, &transport).await
    }
}
