//! In-memory `PlatformClient` for convergence tests
//!
//! Behaves like a tiny API server: names are unique per kind and namespace,
//! status writes are compare-and-swap on `resourceVersion`, and every write
//! is appended to a log tests can assert on. Pods start unready; tests flip
//! them with [`FakePlatform::mark_all_ready`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::{ChildKind, ChildResource, ObservedChildren, PlatformClient};
use crate::compiler::{INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL};
use crate::crd::{AuthCluster, AuthClusterSpec, AuthClusterStatus};
use crate::Error;

/// One mutating call, as seen by the fake API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Write {
    Create(ChildKind, String),
    Patch(ChildKind, String),
    Adopt(ChildKind, String),
    Delete(ChildKind, String),
    Status(String),
}

impl Write {
    pub(crate) fn is_child_write(&self) -> bool {
        !matches!(self, Write::Status(_))
    }
}

type ObjectKey = (ChildKind, String, String);

#[derive(Default)]
struct State {
    clusters: BTreeMap<(String, String), AuthCluster>,
    objects: BTreeMap<ObjectKey, ChildResource>,
    writes: Vec<Write>,
    racing_creates: BTreeSet<String>,
    status_conflicts: u32,
    failing_writes: Option<u16>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_write(&self) -> Result<(), Error> {
        match self.failing_writes {
            Some(code) => Err(Error::api(code, "InternalError", "injected failure")),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakePlatform {
    state: Mutex<State>,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store a cluster as if `kubectl apply` had created it
    pub(crate) fn insert_cluster(&self, mut cluster: AuthCluster) -> AuthCluster {
        let mut state = self.state.lock().unwrap();
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let name = cluster.name_any();
        cluster.metadata.namespace = Some(namespace.clone());
        cluster.metadata.uid.get_or_insert_with(|| format!("uid-{}", name));
        cluster.metadata.generation.get_or_insert(1);
        cluster.metadata.resource_version = Some(state.next_version());
        state
            .clusters
            .insert((namespace, name), cluster.clone());
        cluster
    }

    /// Edit a stored cluster's spec, bumping its generation
    pub(crate) fn edit_spec(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut AuthClusterSpec),
    ) -> AuthCluster {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let cluster = state
            .clusters
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        edit(&mut cluster.spec);
        cluster.metadata.generation = Some(cluster.metadata.generation.unwrap_or(0) + 1);
        cluster.metadata.resource_version = Some(version);
        cluster.clone()
    }

    pub(crate) fn remove_cluster(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .clusters
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub(crate) fn cluster(&self, namespace: &str, name: &str) -> Option<AuthCluster> {
        let state = self.state.lock().unwrap();
        state
            .clusters
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn status(&self, namespace: &str, name: &str) -> Option<AuthClusterStatus> {
        self.cluster(namespace, name).and_then(|c| c.status)
    }

    pub(crate) fn object(&self, kind: ChildKind, namespace: &str, name: &str) -> Option<ChildResource> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of every stored object of `kind`, sorted
    pub(crate) fn names(&self, kind: ChildKind, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Put an object in place without logging a write
    pub(crate) fn seed(&self, child: ChildResource) {
        let mut state = self.state.lock().unwrap();
        let key = key_of(&child);
        state.objects.insert(key, child);
    }

    /// Drop an object's labels, as a foreign writer or a stale copy would
    pub(crate) fn strip_labels(&self, kind: ChildKind, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
        {
            let meta = meta_mut(object);
            meta.labels = None;
            meta.owner_references = None;
        }
    }

    /// Remove an object behind the controller's back
    pub(crate) fn remove_object(&self, kind: ChildKind, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }

    pub(crate) fn writes(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }

    pub(crate) fn take_writes(&self) -> Vec<Write> {
        std::mem::take(&mut self.state.lock().unwrap().writes)
    }

    /// Report every Pod in `namespace` as Ready
    pub(crate) fn mark_all_ready(&self, namespace: &str) {
        let mut state = self.state.lock().unwrap();
        for ((_, ns, _), object) in state.objects.iter_mut() {
            if ns != namespace {
                continue;
            }
            if let ChildResource::Replica(pod) = object {
                pod.status = Some(ready_status());
            }
        }
    }

    /// Report a single Pod as Ready
    pub(crate) fn mark_ready(&self, namespace: &str, pod: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(ChildResource::Replica(pod)) = state.objects.get_mut(&(
            ChildKind::Replica,
            namespace.to_string(),
            pod.to_string(),
        )) {
            pod.status = Some(ready_status());
        }
    }

    /// The next create of `name` loses a race against another writer
    pub(crate) fn race_create(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .racing_creates
            .insert(name.to_string());
    }

    /// The next `n` status writes see a concurrent update first
    pub(crate) fn conflict_status_writes(&self, n: u32) {
        self.state.lock().unwrap().status_conflicts = n;
    }

    /// Fail every child write with `code` until cleared with `None`
    pub(crate) fn fail_writes(&self, code: Option<u16>) {
        self.state.lock().unwrap().failing_writes = code;
    }
}

fn key_of(child: &ChildResource) -> ObjectKey {
    (
        child.kind(),
        child.namespace().unwrap_or_default().to_string(),
        child.name().to_string(),
    )
}

fn ready_status() -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn meta_mut(child: &mut ChildResource) -> &mut ObjectMeta {
    match child {
        ChildResource::Service(o) => &mut o.metadata,
        ChildResource::PeerList(o) => &mut o.metadata,
        ChildResource::Claim(o) => &mut o.metadata,
        ChildResource::Replica(o) => &mut o.metadata,
    }
}

fn stamp(child: &ChildResource, version: String) -> ChildResource {
    let mut child = child.clone();
    meta_mut(&mut child).resource_version = Some(version);
    child
}

fn belongs_to(child: &ChildResource, cluster: &str) -> bool {
    child.meta().labels.as_ref().is_some_and(|labels| {
        labels.get(INSTANCE_LABEL).map(String::as_str) == Some(cluster)
            && labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY)
    })
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<AuthCluster>, Error> {
        Ok(self.cluster(namespace, name))
    }

    async fn list_children(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<ObservedChildren, Error> {
        let state = self.state.lock().unwrap();
        let (mut services, mut config_maps, mut claims, mut pods) =
            (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for ((_, ns, _), object) in &state.objects {
            if ns != namespace || !belongs_to(object, cluster) {
                continue;
            }
            match object.clone() {
                ChildResource::Service(o) => services.push(o),
                ChildResource::PeerList(o) => config_maps.push(o),
                ChildResource::Claim(o) => claims.push(o),
                ChildResource::Replica(o) => pods.push(o),
            }
        }
        Ok(ObservedChildren::from_lists(
            cluster,
            services,
            config_maps,
            claims,
            pods,
        ))
    }

    async fn create(&self, child: &ChildResource) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.check_write()?;
        let key = key_of(child);

        if state.racing_creates.remove(child.name()) {
            let version = state.next_version();
            state.objects.insert(key, stamp(child, version));
            return Err(Error::api(409, "AlreadyExists", "created concurrently"));
        }
        if state.objects.contains_key(&key) {
            return Err(Error::api(409, "AlreadyExists", "already exists"));
        }

        let version = state.next_version();
        state.objects.insert(key, stamp(child, version));
        state
            .writes
            .push(Write::Create(child.kind(), child.name().to_string()));
        Ok(())
    }

    async fn patch(&self, child: &ChildResource) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.check_write()?;
        let key = key_of(child);
        let version = state.next_version();

        let Some(existing) = state.objects.get_mut(&key) else {
            return Err(Error::api(404, "NotFound", "not found"));
        };
        let mut patched = stamp(child, version);
        // Status is owned by other controllers and survives apply
        match (&mut patched, &*existing) {
            (ChildResource::Claim(new), ChildResource::Claim(old)) => new.status = old.status.clone(),
            (ChildResource::Replica(new), ChildResource::Replica(old)) => {
                new.status = old.status.clone()
            }
            _ => {}
        }
        *existing = patched;
        state
            .writes
            .push(Write::Patch(child.kind(), child.name().to_string()));
        Ok(())
    }

    async fn adopt(&self, child: &ChildResource) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.check_write()?;
        let key = key_of(child);
        let version = state.next_version();

        let Some(existing) = state.objects.get_mut(&key) else {
            return Err(Error::api(404, "NotFound", "not found"));
        };
        let meta = meta_mut(existing);
        meta.labels
            .get_or_insert_with(Default::default)
            .extend(child.meta().labels.clone().unwrap_or_default());
        meta.owner_references = child.meta().owner_references.clone();
        meta.resource_version = Some(version);
        state
            .writes
            .push(Write::Adopt(child.kind(), child.name().to_string()));
        Ok(())
    }

    async fn delete(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.check_write()?;
        let key = (kind, namespace.to_string(), name.to_string());
        if state.objects.remove(&key).is_none() {
            return Err(Error::api(404, "NotFound", "not found"));
        }
        state.writes.push(Write::Delete(kind, name.to_string()));
        Ok(())
    }

    async fn replace_status(
        &self,
        cluster: &AuthCluster,
        status: &AuthClusterStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let key = (
            cluster.namespace().unwrap_or_default(),
            cluster.name_any(),
        );

        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            let version = state.next_version();
            if let Some(stored) = state.clusters.get_mut(&key) {
                stored.metadata.resource_version = Some(version);
            }
            return Err(Error::api(409, "Conflict", "the object has been modified"));
        }

        let version = state.next_version();
        let Some(stored) = state.clusters.get_mut(&key) else {
            return Err(Error::api(404, "NotFound", "not found"));
        };
        if stored.metadata.resource_version != cluster.metadata.resource_version {
            return Err(Error::api(409, "Conflict", "the object has been modified"));
        }
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        state.writes.push(Write::Status(key.1));
        Ok(())
    }
}
