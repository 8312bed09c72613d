//! Namespaced Secret store

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use super::FIELD_MANAGER;
use crate::Error;

const KIND: &str = "Secret";

/// Read and write access to Secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret; [`Error::NotFound`] when absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, Error>;

    /// Create a secret; `metadata.generateName` is honoured when `name` is unset
    async fn create(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Replace an existing secret
    async fn replace(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Delete a secret; [`Error::NotFound`] when absent
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`SecretStore`] backed by the Kubernetes API
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(secret: &Secret) -> Result<String, Error> {
    secret
        .namespace()
        .ok_or_else(|| Error::validation("secret has no namespace"))
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, KIND, name))
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, Error> {
        let namespace = namespace_of(secret)?;
        let name = secret
            .metadata
            .name
            .clone()
            .or_else(|| secret.metadata.generate_name.clone())
            .unwrap_or_default();
        self.api(&namespace)
            .create(&post_params(), secret)
            .await
            .map_err(|e| Error::from_kube(e, KIND, &name))
    }

    async fn replace(&self, secret: &Secret) -> Result<Secret, Error> {
        let namespace = namespace_of(secret)?;
        let name = secret.name_any();
        self.api(&namespace)
            .replace(&name, &post_params(), secret)
            .await
            .map_err(|e| Error::from_kube(e, KIND, &name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(e, KIND, name))
    }
}
