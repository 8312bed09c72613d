//! Dynamically-typed access to provider config resources (e.g. AKSClusterConfig)

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, PostParams, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use super::FIELD_MANAGER;
use crate::Error;

/// Operations on one provider's config resource kind in one namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigResourceClient: Send + Sync {
    /// Whether the config resource CRD is installed and Established
    async fn is_registered(&self) -> Result<bool, Error>;

    /// Fetch a config resource, `None` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<DynamicObject>, Error>;

    /// Create a config resource
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Replace a config resource, guarded by its resourceVersion
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Open a watch on the config resource with the given name
    ///
    /// The watch is established when this returns, so no change made after
    /// the call is missed.
    async fn watch(&self, name: &str) -> Result<ConfigWatch, Error>;
}

/// Stream of observed versions of one config resource
///
/// Dropping the watch stops the underlying API watch.
pub struct ConfigWatch {
    events: mpsc::Receiver<DynamicObject>,
    task: Option<JoinHandle<()>>,
    _idle: Option<mpsc::Sender<DynamicObject>>,
}

impl ConfigWatch {
    fn from_task(events: mpsc::Receiver<DynamicObject>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
            _idle: None,
        }
    }

    /// A watch that yields `objects` in order and then closes
    pub fn from_objects(objects: Vec<DynamicObject>) -> Self {
        let (tx, rx) = mpsc::channel(objects.len().max(1));
        for obj in objects {
            // capacity covers every object
            let _ = tx.try_send(obj);
        }
        Self {
            events: rx,
            task: None,
            _idle: None,
        }
    }

    /// A watch that never yields and never closes
    pub fn pending() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            events: rx,
            task: None,
            _idle: Some(tx),
        }
    }

    /// Next observed version, `None` once the watch has closed
    pub async fn next(&mut self) -> Option<DynamicObject> {
        self.events.recv().await
    }
}

impl Drop for ConfigWatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// [`ConfigResourceClient`] backed by the Kubernetes dynamic API
pub struct KubeConfigResourceClient {
    client: Client,
    resource: ApiResource,
    crd_name: String,
    namespace: String,
}

impl KubeConfigResourceClient {
    /// Create a client for `resource` in `namespace`; `crd_name` is the
    /// CustomResourceDefinition that must be Established before use.
    pub fn new(
        client: Client,
        resource: ApiResource,
        crd_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            resource,
            crd_name: crd_name.into(),
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &self.resource)
    }

    fn map_err(&self, err: kube::Error, name: &str) -> Error {
        Error::from_kube(err, &self.resource.kind, name)
    }
}

#[async_trait]
impl ConfigResourceClient for KubeConfigResourceClient {
    async fn is_registered(&self) -> Result<bool, Error> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        let crd = match crds.get(&self.crd_name).await {
            Ok(crd) => crd,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let established = crd
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Established" && c.status == "True");

        Ok(established)
    }

    async fn get(&self, name: &str) -> Result<Option<DynamicObject>, Error> {
        self.api()
            .get_opt(name)
            .await
            .map_err(|e| self.map_err(e, name))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api()
            .create(&pp, obj)
            .await
            .map_err(|e| self.map_err(e, &obj.name_any()))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let name = obj.name_any();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api()
            .replace(&name, &pp, obj)
            .await
            .map_err(|e| self.map_err(e, &name))
    }

    async fn watch(&self, name: &str) -> Result<ConfigWatch, Error> {
        let api = self.api();
        let name = name.to_string();
        let (opened_tx, opened_rx) = oneshot::channel::<Result<(), Error>>();
        let (events_tx, events_rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let selector = format!("metadata.name={}", name);

            // Start from the current list version so only later changes are seen
            let list = match api.list(&ListParams::default().fields(&selector)).await {
                Ok(list) => list,
                Err(e) => {
                    let _ = opened_tx.send(Err(e.into()));
                    return;
                }
            };
            let version = list.metadata.resource_version.unwrap_or_default();

            let stream = match api
                .watch(&WatchParams::default().fields(&selector), &version)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = opened_tx.send(Err(e.into()));
                    return;
                }
            };
            if opened_tx.send(Ok(())).is_err() {
                return;
            }

            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                let obj = match event {
                    Ok(WatchEvent::Added(obj)) | Ok(WatchEvent::Modified(obj)) => obj,
                    Ok(WatchEvent::Deleted(_)) | Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(e)) => {
                        warn!(config = %name, error = %e.message, "config resource watch error");
                        break;
                    }
                    Err(e) => {
                        warn!(config = %name, error = %e, "config resource watch failed");
                        break;
                    }
                };
                if events_tx.send(obj).await.is_err() {
                    break;
                }
            }
            debug!(config = %name, "config resource watch closed");
        });

        match opened_rx.await {
            Ok(Ok(())) => Ok(ConfigWatch::from_task(events_rx, task)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::internal("config resource watch task ended before opening")),
        }
    }
}
