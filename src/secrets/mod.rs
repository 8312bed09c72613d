//! Credential secret lifecycle
//!
//! Sensitive values (service account tokens, notifier passwords) are never
//! kept in records. They live in Opaque secrets with a single `credential`
//! key, referenced by name from the record that owns them.
//!
//! Invariants:
//! - a secret is never created for an empty value
//! - an existing secret is rewritten only when its content differs
//! - moving a value into a secret and clearing it from the record happen in
//!   one record update; if that update fails the new secret is deleted

mod notifier;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

pub use notifier::{DingtalkConfig, SmtpConfig, WechatConfig};

use crate::client::{ClusterStore, SecretStore};
use crate::crd::{Condition, ConditionStatus, ConditionType, ManagedCluster};
use crate::Error;

/// Data key holding the credential value
pub const SECRET_KEY: &str = "credential";

/// Owner kind and field a credential belongs to; names generated secrets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CredentialKind {
    /// Owning object kind (e.g. "cluster")
    pub kind: &'static str,
    /// Field the credential came from (e.g. "serviceaccounttoken")
    pub field: &'static str,
}

impl CredentialKind {
    /// Cluster service account token
    pub const SERVICE_ACCOUNT_TOKEN: Self = Self::new("cluster", "serviceaccounttoken");
    /// SMTP notifier password
    pub const SMTP: Self = Self::new("notifier", "smtpconfig");
    /// WeChat notifier secret
    pub const WECHAT: Self = Self::new("notifier", "wechatconfig");
    /// DingTalk notifier secret
    pub const DINGTALK: Self = Self::new("notifier", "dingtalkconfig");

    /// Create a credential kind
    pub const fn new(kind: &'static str, field: &'static str) -> Self {
        Self { kind, field }
    }

    /// `generateName` prefix for new secrets of this kind
    pub fn name_prefix(&self) -> String {
        format!("{}-{}-", self.kind, self.field)
    }
}

/// Creates, updates and removes credential secrets
#[derive(Clone)]
pub struct SecretMigrator {
    secrets: Arc<dyn SecretStore>,
    namespace: String,
}

impl SecretMigrator {
    /// Create a migrator storing secrets in `namespace`
    pub fn new(secrets: Arc<dyn SecretStore>, namespace: impl Into<String>) -> Self {
        Self {
            secrets,
            namespace: namespace.into(),
        }
    }

    /// Namespace credential secrets are stored in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Store `value` in a credential secret
    ///
    /// With `name` set the existing secret is updated, or created under that
    /// name if absent. Without a name the server generates one from `kind`.
    /// Returns `Ok(None)` without touching the store when `value` is empty.
    pub async fn create_or_update(
        &self,
        name: Option<&str>,
        namespace: &str,
        value: &str,
        annotations: Option<BTreeMap<String, String>>,
        owner: Option<OwnerReference>,
        kind: CredentialKind,
    ) -> Result<Option<Secret>, Error> {
        if value.is_empty() {
            debug!(
                namespace,
                name = name.unwrap_or_default(),
                "refusing to create empty credential secret"
            );
            return Ok(None);
        }

        let name = name.filter(|n| !n.is_empty());
        let existing = match name {
            Some(name) => match self.secrets.get(namespace, name).await {
                Ok(secret) => Some(secret),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let data = credential_data(value);

        let Some(mut existing) = existing else {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: name.map(str::to_string),
                    generate_name: Some(kind.name_prefix()),
                    namespace: Some(namespace.to_string()),
                    annotations,
                    owner_references: owner.map(|o| vec![o]),
                    ..Default::default()
                },
                data: Some(data),
                type_: Some("Opaque".to_string()),
                ..Default::default()
            };
            let created = self.secrets.create(&secret).await?;
            info!(
                secret = %created.name_any(),
                namespace,
                kind = kind.kind,
                field = kind.field,
                "created credential secret"
            );
            return Ok(Some(created));
        };

        if existing.data.as_ref() == Some(&data) {
            return Ok(Some(existing));
        }

        existing.data = Some(data);
        existing.string_data = None;
        let updated = self.secrets.replace(&existing).await?;
        debug!(secret = %updated.name_any(), namespace, "updated credential secret");
        Ok(Some(updated))
    }

    /// Attach `owner` as the sole owner reference, unless it already is the first one
    pub async fn update_owner_reference(
        &self,
        secret: &Secret,
        owner: OwnerReference,
    ) -> Result<(), Error> {
        let current = secret
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.first());
        if current == Some(&owner) {
            return Ok(());
        }

        let mut updated = secret.clone();
        updated.metadata.owner_references = Some(vec![owner]);
        self.secrets.replace(&updated).await?;
        Ok(())
    }

    /// Delete a credential secret by name; absent secrets and empty names are fine
    pub async fn cleanup(&self, name: &str) -> Result<(), Error> {
        if name.is_empty() {
            return Ok(());
        }
        match self.secrets.delete(&self.namespace, name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete each secret, logging failures instead of returning them
    pub async fn cleanup_known(&self, secrets: &[Secret]) {
        for secret in secrets {
            let namespace = secret.namespace().unwrap_or_else(|| self.namespace.clone());
            let name = secret.name_any();
            if let Err(e) = self.secrets.delete(&namespace, &name).await {
                warn!(
                    secret = %name,
                    %namespace,
                    error = %e,
                    "secret may not have been cleaned up after a failed migration"
                );
            }
        }
    }

    /// Store a cluster's service account token
    pub async fn create_or_update_service_account_token(
        &self,
        name: Option<&str>,
        token: &str,
        owner: Option<OwnerReference>,
    ) -> Result<Option<Secret>, Error> {
        self.create_or_update(
            name,
            &self.namespace,
            token,
            None,
            owner,
            CredentialKind::SERVICE_ACCOUNT_TOKEN,
        )
        .await
    }

    /// Store an SMTP notifier password
    pub async fn create_or_update_smtp(
        &self,
        name: Option<&str>,
        config: Option<&SmtpConfig>,
        owner: Option<OwnerReference>,
    ) -> Result<Option<Secret>, Error> {
        let Some(config) = config else {
            return Ok(None);
        };
        self.create_or_update(
            name,
            &self.namespace,
            &config.password,
            None,
            owner,
            CredentialKind::SMTP,
        )
        .await
    }

    /// Store a WeChat notifier secret
    pub async fn create_or_update_wechat(
        &self,
        name: Option<&str>,
        config: Option<&WechatConfig>,
        owner: Option<OwnerReference>,
    ) -> Result<Option<Secret>, Error> {
        let Some(config) = config else {
            return Ok(None);
        };
        self.create_or_update(
            name,
            &self.namespace,
            &config.secret,
            None,
            owner,
            CredentialKind::WECHAT,
        )
        .await
    }

    /// Store a DingTalk notifier secret
    pub async fn create_or_update_dingtalk(
        &self,
        name: Option<&str>,
        config: Option<&DingtalkConfig>,
        owner: Option<OwnerReference>,
    ) -> Result<Option<Secret>, Error> {
        let Some(config) = config else {
            return Ok(None);
        };
        self.create_or_update(
            name,
            &self.namespace,
            &config.secret,
            None,
            owner,
            CredentialKind::DINGTALK,
        )
        .await
    }

    /// Move a legacy in-record service account token into a secret
    ///
    /// The secret reference is set and the raw token cleared in one record
    /// update. If that update fails the secret is deleted again and the error
    /// returned. Afterwards `ServiceAccountSecretsMigrated` is set to True.
    pub async fn migrate_service_account_token(
        &self,
        cluster: &ManagedCluster,
        clusters: &dyn ClusterStore,
    ) -> Result<ManagedCluster, Error> {
        if cluster.condition_status(ConditionType::ServiceAccountSecretsMigrated)
            == ConditionStatus::True
        {
            return Ok(cluster.clone());
        }

        let name = cluster.name_any();
        let status = cluster.status_or_default();
        let mut current = cluster.clone();

        if status.token_secret().is_none() {
            let token = status.service_account_token.as_deref().unwrap_or_default();
            let owner = cluster.owner_reference()?;
            if let Some(secret) = self
                .create_or_update_service_account_token(None, token, Some(owner))
                .await?
            {
                let secret_name = secret.name_any();
                let mut migrated = current.clone();
                let migrated_status = migrated.status.get_or_insert_with(Default::default);
                migrated_status.service_account_token_secret = Some(secret_name.clone());
                migrated_status.service_account_token = None;

                current = match clusters.update_status(&migrated).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        error!(
                            cluster = %name,
                            error = %e,
                            "failed to migrate service account token, will retry"
                        );
                        if let Err(delete_err) =
                            self.secrets.delete(&self.namespace, &secret_name).await
                        {
                            error!(
                                cluster = %name,
                                secret = %secret_name,
                                error = %delete_err,
                                "failed to remove secret after migration error"
                            );
                        }
                        return Err(e);
                    }
                };
                info!(cluster = %name, secret = %secret_name, "migrated service account token");
            }
        }

        let mut marked = current;
        marked
            .status
            .get_or_insert_with(Default::default)
            .set_condition(Condition::new(
                ConditionType::ServiceAccountSecretsMigrated,
                ConditionStatus::True,
                "",
            ));
        clusters.update_status(&marked).await
    }
}

fn credential_data(value: &str) -> BTreeMap<String, ByteString> {
    BTreeMap::from([(
        SECRET_KEY.to_string(),
        ByteString(value.as_bytes().to_vec()),
    )])
}

/// Read the credential value out of a secret
pub fn credential_value(secret: &Secret) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(SECRET_KEY))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClusterStore, MockSecretStore};
    use crate::crd::{ManagedClusterSpec, ManagedClusterStatus};
    use std::sync::Mutex;

    const NS: &str = "hosted-global-data";

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "management.hosted.dev/v1".to_string(),
            kind: "ManagedCluster".to_string(),
            name: "c1".to_string(),
            uid: "uid-1".to_string(),
            ..Default::default()
        }
    }

    fn stored_secret(name: &str, value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            data: Some(credential_data(value)),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Mimics the API server assigning a name from generateName
    fn name_generated(secret: &Secret) -> Secret {
        let mut created = secret.clone();
        if created.metadata.name.is_none() {
            let prefix = created.metadata.generate_name.clone().unwrap_or_default();
            created.metadata.name = Some(format!("{}abcde", prefix));
        }
        created
    }

    fn legacy_cluster(token: Option<&str>) -> ManagedCluster {
        let mut cluster = ManagedCluster::new("c1", ManagedClusterSpec::default());
        cluster.metadata.uid = Some("uid-1".to_string());
        cluster.status = Some(ManagedClusterStatus {
            service_account_token: token.map(str::to_string),
            ..Default::default()
        });
        cluster
    }

    mod create_or_update {
        use super::*;

        /// Story: empty credentials never produce a secret
        #[tokio::test]
        async fn story_empty_value_touches_nothing() {
            let mut store = MockSecretStore::new();
            store.expect_get().never();
            store.expect_create().never();
            store.expect_replace().never();
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            let result = migrator
                .create_or_update(
                    Some("existing"),
                    NS,
                    "",
                    None,
                    Some(owner()),
                    CredentialKind::SMTP,
                )
                .await
                .unwrap();
            assert!(result.is_none());
        }

        /// Story: a new credential gets a generated name from its kind and field
        #[tokio::test]
        async fn story_unnamed_credential_is_created_with_generated_name() {
            let mut store = MockSecretStore::new();
            store.expect_get().never();
            store
                .expect_create()
                .times(1)
                .withf(|s| {
                    s.metadata.generate_name.as_deref() == Some("cluster-serviceaccounttoken-")
                        && s.metadata.namespace.as_deref() == Some(NS)
                        && s.metadata.owner_references.as_ref().map(Vec::len) == Some(1)
                        && credential_value(s).as_deref() == Some("tok")
                })
                .returning(|s| Ok(name_generated(s)));
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            let secret = migrator
                .create_or_update_service_account_token(None, "tok", Some(owner()))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(secret.name_any(), "cluster-serviceaccounttoken-abcde");
        }

        /// Story: a named credential written twice with the same value is
        /// created once and never replaced
        #[tokio::test]
        async fn story_create_then_identical_rerun_writes_once() {
            let stored: Arc<Mutex<Option<Secret>>> = Arc::new(Mutex::new(None));
            let mut store = MockSecretStore::new();
            let lookup = stored.clone();
            store
                .expect_get()
                .times(2)
                .withf(|ns, name| ns == NS && name == "notifier-smtpconfig-x")
                .returning(move |_, name| {
                    lookup
                        .lock()
                        .unwrap()
                        .clone()
                        .ok_or_else(|| Error::not_found("Secret", name))
                });
            let created = stored.clone();
            store.expect_create().times(1).returning(move |s| {
                let secret = name_generated(s);
                *created.lock().unwrap() = Some(secret.clone());
                Ok(secret)
            });
            store.expect_replace().never();
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            for _ in 0..2 {
                let secret = migrator
                    .create_or_update(
                        Some("notifier-smtpconfig-x"),
                        NS,
                        "v",
                        None,
                        Some(owner()),
                        CredentialKind::SMTP,
                    )
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(secret.name_any(), "notifier-smtpconfig-x");
                assert_eq!(credential_value(&secret).as_deref(), Some("v"));
            }
        }

        #[tokio::test]
        async fn test_existing_identical_content_is_not_rewritten() {
            let mut store = MockSecretStore::new();
            store
                .expect_get()
                .returning(|_, name| Ok(stored_secret(name, "hunter2")));
            store.expect_create().never();
            store.expect_replace().never();
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            let smtp = SmtpConfig {
                password: "hunter2".to_string(),
                ..Default::default()
            };
            let secret = migrator
                .create_or_update_smtp(Some("notifier-smtpconfig-x"), Some(&smtp), None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(secret.name_any(), "notifier-smtpconfig-x");
        }

        #[tokio::test]
        async fn test_changed_content_replaces_existing() {
            let mut store = MockSecretStore::new();
            store
                .expect_get()
                .returning(|_, name| Ok(stored_secret(name, "old")));
            store
                .expect_replace()
                .times(1)
                .withf(|s| credential_value(s).as_deref() == Some("new"))
                .returning(|s| Ok(s.clone()));
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            let wechat = WechatConfig {
                secret: "new".to_string(),
                ..Default::default()
            };
            migrator
                .create_or_update_wechat(Some("notifier-wechatconfig-x"), Some(&wechat), None)
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_named_but_absent_secret_is_created_under_that_name() {
            let mut store = MockSecretStore::new();
            store
                .expect_get()
                .returning(|_, name| Err(Error::not_found("Secret", name)));
            store
                .expect_create()
                .times(1)
                .withf(|s| s.metadata.name.as_deref() == Some("notifier-dingtalkconfig-x"))
                .returning(|s| Ok(s.clone()));
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            let dingtalk = DingtalkConfig {
                secret: "s".to_string(),
                ..Default::default()
            };
            let secret = migrator
                .create_or_update_dingtalk(Some("notifier-dingtalkconfig-x"), Some(&dingtalk), None)
                .await
                .unwrap();
            assert!(secret.is_some());
        }

        #[tokio::test]
        async fn test_missing_notifier_config_is_a_no_op() {
            let store = MockSecretStore::new();
            let migrator = SecretMigrator::new(Arc::new(store), NS);
            assert!(migrator
                .create_or_update_smtp(None, None, None)
                .await
                .unwrap()
                .is_none());
        }

        #[tokio::test]
        async fn test_lookup_errors_propagate() {
            let mut store = MockSecretStore::new();
            store
                .expect_get()
                .returning(|_, _| Err(Error::internal("apiserver unavailable")));
            store.expect_create().never();
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            let err = migrator
                .create_or_update_service_account_token(Some("s"), "tok", None)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Internal(_)));
        }
    }

    mod owner_and_cleanup {
        use super::*;

        #[tokio::test]
        async fn test_matching_owner_reference_is_not_rewritten() {
            let mut store = MockSecretStore::new();
            store.expect_replace().never();
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            let mut secret = stored_secret("s", "v");
            secret.metadata.owner_references = Some(vec![owner()]);
            migrator
                .update_owner_reference(&secret, owner())
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_new_owner_reference_is_written() {
            let mut store = MockSecretStore::new();
            store
                .expect_replace()
                .times(1)
                .withf(|s| s.metadata.owner_references == Some(vec![owner()]))
                .returning(|s| Ok(s.clone()));
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            migrator
                .update_owner_reference(&stored_secret("s", "v"), owner())
                .await
                .unwrap();
        }

        /// Story: cleaning up something that is already gone succeeds
        #[tokio::test]
        async fn story_cleanup_of_absent_secret_succeeds() {
            let mut store = MockSecretStore::new();
            store
                .expect_delete()
                .times(1)
                .returning(|_, name| Err(Error::not_found("Secret", name)));
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            migrator.cleanup("gone").await.unwrap();
        }

        #[tokio::test]
        async fn test_cleanup_with_empty_name_is_a_no_op() {
            let mut store = MockSecretStore::new();
            store.expect_delete().never();
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            migrator.cleanup("").await.unwrap();
        }

        #[tokio::test]
        async fn test_cleanup_known_continues_past_failures() {
            let mut store = MockSecretStore::new();
            store
                .expect_delete()
                .times(2)
                .returning(|_, name| {
                    if name == "a" {
                        Err(Error::internal("boom"))
                    } else {
                        Ok(())
                    }
                });
            let migrator = SecretMigrator::new(Arc::new(store), NS);

            migrator
                .cleanup_known(&[stored_secret("a", "1"), stored_secret("b", "2")])
                .await;
        }
    }

    /// Legacy token migration stories
    mod service_account_migration {
        use super::*;

        fn capturing_cluster_store(
            fail_first: bool,
        ) -> (MockClusterStore, Arc<Mutex<Vec<ManagedCluster>>>) {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let captured = writes.clone();
            let mut store = MockClusterStore::new();
            store.expect_update_status().returning(move |c| {
                let mut writes = captured.lock().unwrap();
                writes.push(c.clone());
                if fail_first && writes.len() == 1 {
                    Err(Error::conflict("ManagedCluster", "c1"))
                } else {
                    Ok(c.clone())
                }
            });
            (store, writes)
        }

        /// Story: the raw token moves into a secret in a single record update
        #[tokio::test]
        async fn story_legacy_token_is_moved_and_cleared() {
            let mut secrets = MockSecretStore::new();
            secrets
                .expect_create()
                .times(1)
                .returning(|s| Ok(name_generated(s)));
            secrets.expect_delete().never();
            let migrator = SecretMigrator::new(Arc::new(secrets), NS);
            let (clusters, writes) = capturing_cluster_store(false);

            let result = migrator
                .migrate_service_account_token(&legacy_cluster(Some("raw")), &clusters)
                .await
                .unwrap();

            let writes = writes.lock().unwrap();
            assert_eq!(writes.len(), 2);
            let moved = writes[0].status.as_ref().unwrap();
            assert_eq!(moved.service_account_token, None);
            assert_eq!(
                moved.token_secret(),
                Some("cluster-serviceaccounttoken-abcde")
            );
            assert_eq!(
                result.condition_status(ConditionType::ServiceAccountSecretsMigrated),
                ConditionStatus::True
            );
        }

        /// Story: a failed record update rolls the new secret back
        #[tokio::test]
        async fn story_failed_update_deletes_new_secret() {
            let mut secrets = MockSecretStore::new();
            secrets
                .expect_create()
                .returning(|s| Ok(name_generated(s)));
            secrets
                .expect_delete()
                .times(1)
                .withf(|ns, name| ns == NS && name == "cluster-serviceaccounttoken-abcde")
                .returning(|_, _| Ok(()));
            let migrator = SecretMigrator::new(Arc::new(secrets), NS);
            let (clusters, _) = capturing_cluster_store(true);

            let err = migrator
                .migrate_service_account_token(&legacy_cluster(Some("raw")), &clusters)
                .await
                .unwrap_err();
            assert!(err.is_conflict());
        }

        #[tokio::test]
        async fn test_no_legacy_token_only_marks_migrated() {
            let mut secrets = MockSecretStore::new();
            secrets.expect_create().never();
            let migrator = SecretMigrator::new(Arc::new(secrets), NS);
            let (clusters, writes) = capturing_cluster_store(false);

            migrator
                .migrate_service_account_token(&legacy_cluster(None), &clusters)
                .await
                .unwrap();
            assert_eq!(writes.lock().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_already_migrated_cluster_is_untouched() {
            let secrets = MockSecretStore::new();
            let migrator = SecretMigrator::new(Arc::new(secrets), NS);
            let mut clusters = MockClusterStore::new();
            clusters.expect_update_status().never();

            let mut cluster = legacy_cluster(Some("raw"));
            cluster.status.as_mut().unwrap().set_condition(Condition::new(
                ConditionType::ServiceAccountSecretsMigrated,
                ConditionStatus::True,
                "",
            ));

            let result = migrator
                .migrate_service_account_token(&cluster, &clusters)
                .await
                .unwrap();
            assert_eq!(result, cluster);
        }
    }
}
