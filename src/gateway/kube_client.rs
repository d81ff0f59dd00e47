//! `PlatformClient` backed by the Kubernetes API server

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{ChildKind, ChildResource, ObservedChildren, PlatformClient};
use crate::compiler::child_selector;
use crate::crd::{AuthCluster, AuthClusterStatus};
use crate::{Error, FIELD_MANAGER};

/// Real Kubernetes client implementation
pub struct KubePlatformClient {
    client: Client,
    timeout: Duration,
}

impl KubePlatformClient {
    /// Create a client whose calls each give up after `timeout`
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Run one API call under the configured deadline
    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::timeout(operation, self.timeout)),
        }
    }

    async fn list<K>(&self, namespace: &str, selector: &str) -> Result<Vec<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.api::<K>(namespace);
        let params = ListParams::default().labels(selector);
        let operation = format!("list {}", K::kind(&()));
        let list = self.bounded(&operation, api.list(&params)).await?;
        Ok(list.items)
    }

    async fn create_object<K>(&self, namespace: &str, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api = self.api::<K>(namespace);
        let operation = format!("create {} {}", K::kind(&()), obj.name_any());
        self.bounded(&operation, api.create(&PostParams::default(), obj))
            .await?;
        Ok(())
    }

    async fn apply_object<K>(&self, namespace: &str, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api = self.api::<K>(namespace);
        let name = obj.name_any();
        let operation = format!("patch {} {}", K::kind(&()), name);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.bounded(&operation, api.patch(&name, &params, &Patch::Apply(obj)))
            .await?;
        Ok(())
    }

    /// Merge `child`'s labels and owner references onto the live object
    async fn merge_metadata<K>(&self, namespace: &str, child: &ChildResource) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.api::<K>(namespace);
        let name = child.name();
        let meta = child.meta();
        let patch = serde_json::json!({
            "metadata": {
                "labels": meta.labels,
                "ownerReferences": meta.owner_references,
            }
        });
        let operation = format!("adopt {} {}", K::kind(&()), name);
        self.bounded(
            &operation,
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }

    async fn delete_object<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.api::<K>(namespace);
        let operation = format!("delete {} {}", K::kind(&()), name);
        self.bounded(&operation, api.delete(name, &DeleteParams::default()))
            .await?;
        Ok(())
    }
}

fn namespace_of(child: &ChildResource) -> Result<&str, Error> {
    child.namespace().ok_or_else(|| {
        Error::missing_field(format!(
            "{} {} metadata.namespace",
            child.kind(),
            child.name()
        ))
    })
}

#[async_trait]
impl PlatformClient for KubePlatformClient {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<AuthCluster>, Error> {
        let api = self.api::<AuthCluster>(namespace);
        let operation = format!("get AuthCluster {}/{}", namespace, name);
        self.bounded(&operation, api.get_opt(name)).await
    }

    async fn list_children(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<ObservedChildren, Error> {
        let selector = child_selector(cluster);
        let (services, config_maps, claims, pods) = tokio::try_join!(
            self.list::<Service>(namespace, &selector),
            self.list::<ConfigMap>(namespace, &selector),
            self.list::<PersistentVolumeClaim>(namespace, &selector),
            self.list::<Pod>(namespace, &selector),
        )?;
        debug!(
            services = services.len(),
            config_maps = config_maps.len(),
            claims = claims.len(),
            pods = pods.len(),
            "listed children"
        );
        Ok(ObservedChildren::from_lists(
            cluster,
            services,
            config_maps,
            claims,
            pods,
        ))
    }

    async fn create(&self, child: &ChildResource) -> Result<(), Error> {
        let namespace = namespace_of(child)?;
        match child {
            ChildResource::Service(o) => self.create_object(namespace, o).await,
            ChildResource::PeerList(o) => self.create_object(namespace, o).await,
            ChildResource::Claim(o) => self.create_object(namespace, o).await,
            ChildResource::Replica(o) => self.create_object(namespace, o).await,
        }
    }

    async fn patch(&self, child: &ChildResource) -> Result<(), Error> {
        let namespace = namespace_of(child)?;
        match child {
            ChildResource::Service(o) => self.apply_object(namespace, o).await,
            ChildResource::PeerList(o) => self.apply_object(namespace, o).await,
            ChildResource::Claim(o) => self.apply_object(namespace, o).await,
            ChildResource::Replica(o) => self.apply_object(namespace, o).await,
        }
    }

    async fn adopt(&self, child: &ChildResource) -> Result<(), Error> {
        let namespace = namespace_of(child)?;
        match child.kind() {
            ChildKind::Service => self.merge_metadata::<Service>(namespace, child).await,
            ChildKind::PeerList => self.merge_metadata::<ConfigMap>(namespace, child).await,
            ChildKind::Claim => {
                self.merge_metadata::<PersistentVolumeClaim>(namespace, child)
                    .await
            }
            ChildKind::Replica => self.merge_metadata::<Pod>(namespace, child).await,
        }
    }

    async fn delete(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error> {
        match kind {
            ChildKind::Service => self.delete_object::<Service>(namespace, name).await,
            ChildKind::PeerList => self.delete_object::<ConfigMap>(namespace, name).await,
            ChildKind::Claim => {
                self.delete_object::<PersistentVolumeClaim>(namespace, name)
                    .await
            }
            ChildKind::Replica => self.delete_object::<Pod>(namespace, name).await,
        }
    }

    async fn replace_status(
        &self,
        cluster: &AuthCluster,
        status: &AuthClusterStatus,
    ) -> Result<(), Error> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::missing_field("metadata.namespace"))?;
        let name = cluster.name_any();
        let api = self.api::<AuthCluster>(&namespace);

        // resourceVersion turns the merge patch into a compare-and-swap
        let status_patch = serde_json::json!({
            "metadata": { "resourceVersion": cluster.resource_version() },
            "status": status
        });

        let operation = format!("patch AuthCluster {}/{} status", namespace, name);
        self.bounded(
            &operation,
            api.patch_status(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            ),
        )
        .await?;
        Ok(())
    }
}
