//! Service account token issuance on downstream clusters
//!
//! The operator keeps a long-lived `cluster-admin` service account token for
//! every hosted cluster. Issuing one means connecting to the downstream API
//! server with the provider credential's bearer token, ensuring the service
//! account, its binding and a token secret exist, then reading the token the
//! downstream token controller populates.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::io::ErrorKind;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::{Client, Config, Resource, ResourceExt};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::{ProbeError, ProbeErrorKind, Transport};
use crate::client::{SecretStore, FIELD_MANAGER};
use crate::crd::ManagedCluster;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::secrets::credential_value;
use crate::Error;

/// Namespace on the downstream cluster holding the operator's identity
pub const DOWNSTREAM_NAMESPACE: &str = "kube-system";

/// Name of the service account (and its token secret prefix) on the downstream cluster
pub const DOWNSTREAM_ACCOUNT: &str = "hosted-operator";

const TOKEN_KEY: &str = "token";

/// Issues a service account token on a downstream cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Connect to `cluster` over `transport` and return a service account token
    ///
    /// Connection failures are reported as [`Error::Probe`] so callers can
    /// classify them.
    async fn issue_token(
        &self,
        cluster: &ManagedCluster,
        transport: &Transport,
    ) -> Result<String, Error>;
}

/// [`TokenIssuer`] talking to the downstream cluster through kube-rs
pub struct KubeTokenIssuer {
    secrets: Arc<dyn SecretStore>,
    default_namespace: String,
    token_retry: RetryConfig,
}

impl KubeTokenIssuer {
    /// Create an issuer
    ///
    /// `default_namespace` is used for credential references that carry no
    /// namespace part.
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        default_namespace: impl Into<String>,
        token_retry: RetryConfig,
    ) -> Self {
        Self {
            secrets,
            default_namespace: default_namespace.into(),
            token_retry,
        }
    }

    async fn bearer_token(&self, cluster: &ManagedCluster) -> Result<String, Error> {
        let reference = cluster
            .spec
            .provider
            .as_ref()
            .map(|p| p.credential_secret())
            .unwrap_or_default();
        let (namespace, name) = split_credential_ref(reference, &self.default_namespace)
            .ok_or_else(|| {
                Error::validation(format!(
                    "cluster {} has no cloud credential",
                    cluster.name_any()
                ))
            })?;

        let secret = self.secrets.get(namespace, name).await?;
        data_value(&secret, TOKEN_KEY)
            .or_else(|| credential_value(&secret))
            .ok_or_else(|| {
                Error::validation(format!("cloud credential {}:{} has no token", namespace, name))
            })
    }
}

#[async_trait]
impl TokenIssuer for KubeTokenIssuer {
    async fn issue_token(
        &self,
        cluster: &ManagedCluster,
        transport: &Transport,
    ) -> Result<String, Error> {
        let name = cluster.name_any();
        let bearer = self.bearer_token(cluster).await?;
        let config = downstream_config(cluster, bearer, transport)?;
        let client = Client::try_from(config).map_err(probe_error)?;

        debug!(cluster = %name, "ensuring service account on downstream cluster");
        ensure(
            &Api::<ServiceAccount>::namespaced(client.clone(), DOWNSTREAM_NAMESPACE),
            &service_account(),
        )
        .await?;
        ensure(
            &Api::<ClusterRoleBinding>::all(client.clone()),
            &cluster_admin_binding(),
        )
        .await?;

        let secrets = Api::<Secret>::namespaced(client, DOWNSTREAM_NAMESPACE);
        let token_secret = token_secret();
        ensure(&secrets, &token_secret).await?;

        let secret_name = token_secret.name_any();
        let token = retry_with_backoff(&self.token_retry, "read_service_account_token", || {
            let secrets = secrets.clone();
            let secret_name = secret_name.clone();
            async move {
                let secret = secrets.get(&secret_name).await.map_err(probe_error)?;
                data_value(&secret, TOKEN_KEY).ok_or_else(|| {
                    Error::not_yet_available(format!("token secret {} not populated", secret_name))
                })
            }
        })
        .await?;

        info!(cluster = %name, "issued service account token");
        Ok(token)
    }
}

/// Create `obj` unless it already exists
async fn ensure<K>(api: &Api<K>, obj: &K) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let pp = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    match api.create(&pp, obj).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(probe_error(e)),
    }
}

fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(DOWNSTREAM_ACCOUNT.to_string()),
            namespace: Some(DOWNSTREAM_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn cluster_admin_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{}-admin", DOWNSTREAM_ACCOUNT)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "cluster-admin".to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: DOWNSTREAM_ACCOUNT.to_string(),
            namespace: Some(DOWNSTREAM_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

fn token_secret() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(format!("{}-token", DOWNSTREAM_ACCOUNT)),
            namespace: Some(DOWNSTREAM_NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                "kubernetes.io/service-account.name".to_string(),
                DOWNSTREAM_ACCOUNT.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("kubernetes.io/service-account-token".to_string()),
        ..Default::default()
    }
}

/// Client configuration for reaching `cluster` over `transport`
pub(crate) fn downstream_config(
    cluster: &ManagedCluster,
    bearer: String,
    transport: &Transport,
) -> Result<Config, Error> {
    let status = cluster.status.as_ref();
    let endpoint = status.and_then(|s| s.endpoint()).ok_or_else(|| {
        Error::not_yet_available(format!("cluster {} has no API endpoint", cluster.name_any()))
    })?;
    let uri: http::Uri = endpoint
        .parse()
        .map_err(|e| Error::validation(format!("invalid API endpoint {}: {}", endpoint, e)))?;

    let mut config = Config::new(uri);
    if let Some(ca) = status.and_then(|s| s.ca_cert.as_deref()).filter(|c| !c.is_empty()) {
        let pem = STANDARD
            .decode(ca)
            .map_err(|e| Error::validation(format!("CA is not valid base64: {}", e)))?;
        config.root_cert = Some(pem_to_der(&pem)?);
    }
    config.auth_info.token = Some(SecretString::from(bearer));

    match transport {
        Transport::Direct {
            connect_timeout,
            read_timeout,
        } => {
            config.connect_timeout = Some(*connect_timeout);
            config.read_timeout = Some(*read_timeout);
        }
        Transport::Tunnel { cluster, proxy_url } => {
            let proxy = proxy_url.as_deref().ok_or_else(|| {
                Error::internal(format!("no tunnel proxy configured for cluster {}", cluster))
            })?;
            config.proxy_url = Some(
                proxy
                    .parse()
                    .map_err(|e| Error::validation(format!("invalid proxy URL {}: {}", proxy, e)))?,
            );
        }
    }
    Ok(config)
}

/// DER certificates of a PEM bundle
fn pem_to_der(bundle: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    let certs: Vec<Vec<u8>> = pem::parse_many(bundle)
        .map_err(|e| Error::validation(format!("invalid CA bundle: {}", e)))?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| p.into_contents())
        .collect();
    if certs.is_empty() {
        return Err(Error::validation("CA bundle contains no certificates"));
    }
    Ok(certs)
}

/// Split a `namespace:name` credential reference
fn split_credential_ref<'a>(reference: &'a str, default_namespace: &'a str) -> Option<(&'a str, &'a str)> {
    let (namespace, name) = reference
        .split_once(':')
        .unwrap_or((default_namespace, reference));
    (!namespace.is_empty() && !name.is_empty()).then_some((namespace, name))
}

fn data_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .filter(|v| !v.is_empty())
}

fn probe_error(err: kube::Error) -> Error {
    Error::Probe(ProbeError::new(classify(&err), err.to_string()))
}

/// Classify a connection failure by walking its source chain
pub(crate) fn classify(err: &(dyn StdError + 'static)) -> ProbeErrorKind {
    let mut io_kind = None;
    let mut text = String::new();
    let mut current = Some(err);
    while let Some(e) = current {
        if io_kind.is_none() {
            io_kind = e.downcast_ref::<std::io::Error>().map(|io| io.kind());
        }
        if !text.is_empty() {
            text.push_str(": ");
        }
        text.push_str(&e.to_string().to_lowercase());
        current = e.source();
    }

    if text.contains("dns error")
        || text.contains("failed to lookup address")
        || text.contains("name or service not known")
        || text.contains("no such host")
    {
        return ProbeErrorKind::Dns {
            temporary: text.contains("temporary failure") || text.contains("try again"),
        };
    }

    match io_kind {
        Some(ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) => {
            ProbeErrorKind::Connect
        }
        Some(ErrorKind::TimedOut) if text.contains("connect") => ProbeErrorKind::ConnectTimeout,
        Some(ErrorKind::TimedOut) => ProbeErrorKind::Timeout,
        _ if text.contains("connection refused") => ProbeErrorKind::Connect,
        _ if text.contains("timed out") || text.contains("deadline has elapsed") => {
            ProbeErrorKind::Timeout
        }
        _ => ProbeErrorKind::Other,
    }
}
