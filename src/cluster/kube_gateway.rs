//! Kubernetes implementation of the cluster gateway.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment as WorkloadObject;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info, instrument};

use super::resources::format_label_selector;
use super::{ClusterGateway, ClusterResource, ManagedObject, ResourceKind};
use crate::config::ClusterConfig;
use crate::error::{ControllerError, Result};

/// Namespace-scoped Kubernetes client
#[derive(Clone)]
pub struct KubeClusterGateway {
    client: Client,
    namespace: String,
}

impl Debug for KubeClusterGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterGateway")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl KubeClusterGateway {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a client from the configured kubeconfig, falling back to the inferred config
    pub async fn connect(config: &ClusterConfig) -> Result<Self> {
        let kube_config = match config.resolved_kubeconfig() {
            Some(path) => {
                info!(kubeconfig = %path.display(), "Loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
                    ControllerError::Configuration(format!(
                        "failed to read kubeconfig {}: {e}",
                        path.display()
                    ))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        ControllerError::Configuration(format!("invalid kubeconfig: {e}"))
                    })?
            }
            None => {
                info!("No kubeconfig found, inferring cluster configuration");
                kube::Config::infer().await.map_err(|e| {
                    ControllerError::Configuration(format!(
                        "failed to infer cluster configuration: {e}"
                    ))
                })?
            }
        };

        let client = Client::try_from(kube_config)?;
        Ok(Self::new(client, config.namespace.clone()))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn create_object<K>(&self, kind: ResourceKind, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = object.name_any();
        self.api::<K>()
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| ControllerError::cluster(&format!("create {kind}"), &name, e))?;
        Ok(())
    }

    async fn list_objects<K>(&self, kind: ResourceKind, selector: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let list = self
            .api::<K>()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| ControllerError::cluster(&format!("list {kind}"), selector, e))?;
        Ok(list.items)
    }

    async fn delete_object<K>(&self, kind: ResourceKind, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ControllerError::cluster(&format!("delete {kind}"), name, e))?;
        Ok(())
    }
}

fn managed<K: Resource>(kind: ResourceKind, object: &K) -> ManagedObject {
    ManagedObject {
        kind,
        name: object.name_any(),
        pod_selector: None,
    }
}

#[async_trait]
impl ClusterGateway for KubeClusterGateway {
    #[instrument(skip(self, resource), fields(kind = %resource.kind(), name = ?resource.name()))]
    async fn create(&self, resource: &ClusterResource) -> Result<()> {
        match resource {
            ClusterResource::Workload(object) => {
                self.create_object(ResourceKind::Workload, object).await
            }
            ClusterResource::Service(object) => self.create_object(ResourceKind::Service, object).await,
            ClusterResource::DataConfig(object) => {
                self.create_object(ResourceKind::DataConfig, object).await
            }
        }
    }

    async fn list(&self, kind: ResourceKind, selector: &str) -> Result<Vec<ManagedObject>> {
        let objects = match kind {
            ResourceKind::Workload => {
                let workloads = self.list_objects::<WorkloadObject>(kind, selector).await?;
                workloads
                    .iter()
                    .map(|workload| {
                        let pod_selector = workload
                            .spec
                            .as_ref()
                            .map(|spec| format_label_selector(&spec.selector))
                            .transpose()?;
                        Ok(ManagedObject {
                            pod_selector,
                            ..managed(kind, workload)
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            ResourceKind::Service => self
                .list_objects::<Service>(kind, selector)
                .await?
                .iter()
                .map(|object| managed(kind, object))
                .collect(),
            ResourceKind::DataConfig => self
                .list_objects::<ConfigMap>(kind, selector)
                .await?
                .iter()
                .map(|object| managed(kind, object))
                .collect(),
        };

        debug!(kind = %kind, selector = %selector, found = objects.len(), "Listed managed objects");
        Ok(objects)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        match kind {
            ResourceKind::Workload => self.delete_object::<WorkloadObject>(kind, name).await,
            ResourceKind::Service => self.delete_object::<Service>(kind, name).await,
            ResourceKind::DataConfig => self.delete_object::<ConfigMap>(kind, name).await,
        }
    }

    async fn count_pods(&self, selector: &str) -> Result<usize> {
        let pods = self
            .api::<Pod>()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| ControllerError::cluster("list pods", selector, e))?;
        Ok(pods.items.len())
    }
}
