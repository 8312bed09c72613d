//! Reading the API endpoint and CA published by a provider operator
//!
//! Provider operators write a secret named after the cluster into the config
//! namespace once the cluster is up, with `endpoint` and `ca` keys. It may lag
//! behind the config resource turning active, so it is polled briefly.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use tracing::info;

use crate::client::SecretStore;
use crate::retry::{poll_with_backoff, BackoffSchedule};
use crate::Error;

/// API endpoint and CA of a hosted cluster, as stored on the record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaEndpoint {
    /// URL of the API server, always with a scheme
    pub api_endpoint: String,
    /// Base64-encoded PEM CA bundle
    pub ca_cert: String,
}

fn data_str(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .filter(|v| !v.is_empty())
}

fn with_scheme(endpoint: &str) -> String {
    if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

/// Wait for the provider-published secret and extract endpoint and CA
///
/// Fails with [`Error::NotYetAvailable`] when the secret does not appear
/// within `schedule`; other store errors end the wait immediately.
pub async fn capture_ca_and_endpoint(
    secrets: &dyn SecretStore,
    namespace: &str,
    cluster: &str,
    schedule: &BackoffSchedule,
) -> Result<CaEndpoint, Error> {
    let captured = poll_with_backoff(schedule, "capture_ca_and_endpoint", move || async move {
        let secret = match secrets.get(namespace, cluster).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                info!(cluster, "waiting for cluster data needed to generate service account token");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(endpoint) = data_str(&secret, "endpoint") else {
            return Ok(None);
        };
        let ca = secret
            .data
            .as_ref()
            .and_then(|d| d.get("ca"))
            .map(|v| STANDARD.encode(&v.0))
            .unwrap_or_default();

        Ok(Some(CaEndpoint {
            api_endpoint: with_scheme(&endpoint),
            ca_cert: ca,
        }))
    })
    .await?;

    captured.ok_or_else(|| {
        Error::not_yet_available(format!(
            "timed out waiting for cluster [{}] endpoint secret",
            cluster
        ))
    })
}
