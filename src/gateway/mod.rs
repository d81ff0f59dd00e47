//! Platform API Gateway
//!
//! Every read and write the reconciliation engine performs goes through
//! [`PlatformClient`]. Production code uses [`KubePlatformClient`]; unit tests
//! use mockall mocks or the in-memory fake in `fake`.
//!
//! Errors are returned as the API server reports them. Callers decide which
//! ones are benign (AlreadyExists on create, NotFound on delete) using
//! [`Error::kind`](crate::Error::kind).

mod kube_client;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use crate::compiler::{claim_prefix, discovery_service_name, peers_config_map_name};
use crate::crd::{AuthCluster, AuthClusterStatus};
use crate::topology::parse_ordinal;
use crate::Error;

pub use kube_client::KubePlatformClient;

/// The kinds of child resource an AuthCluster owns
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    /// Headless discovery Service
    Service,
    /// Peer list ConfigMap
    PeerList,
    /// Per-replica PersistentVolumeClaim
    Claim,
    /// Per-replica Pod
    Replica,
}

impl ChildKind {
    /// Every child kind, in creation order
    pub const ALL: [ChildKind; 4] = [
        ChildKind::Service,
        ChildKind::PeerList,
        ChildKind::Claim,
        ChildKind::Replica,
    ];

    /// Kubernetes kind backing this child
    pub fn api_kind(&self) -> &'static str {
        match self {
            Self::Service => "Service",
            Self::PeerList => "ConfigMap",
            Self::Claim => "PersistentVolumeClaim",
            Self::Replica => "Pod",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_kind())
    }
}

/// A concrete child object to create or patch
#[derive(Clone, Debug, PartialEq)]
pub enum ChildResource {
    /// Headless discovery Service
    Service(Service),
    /// Peer list ConfigMap
    PeerList(ConfigMap),
    /// Per-replica claim
    Claim(PersistentVolumeClaim),
    /// Per-replica Pod
    Replica(Pod),
}

impl ChildResource {
    /// Kind of this child
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::Service(_) => ChildKind::Service,
            Self::PeerList(_) => ChildKind::PeerList,
            Self::Claim(_) => ChildKind::Claim,
            Self::Replica(_) => ChildKind::Replica,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Service(o) => &o.metadata,
            Self::PeerList(o) => &o.metadata,
            Self::Claim(o) => &o.metadata,
            Self::Replica(o) => &o.metadata,
        }
    }

    /// Object name (empty when unset)
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }
}

/// Live children of one cluster, keyed the way the engine looks them up
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedChildren {
    /// Discovery Service, if present
    pub service: Option<Service>,
    /// Peer list ConfigMap, if present
    pub peers: Option<ConfigMap>,
    /// Claims by ordinal
    pub claims: BTreeMap<u32, PersistentVolumeClaim>,
    /// Replica Pods by ordinal
    pub replicas: BTreeMap<u32, Pod>,
}

impl ObservedChildren {
    /// Sort listed objects into the slots they occupy for `cluster`.
    ///
    /// Objects whose names do not follow the child naming scheme are ignored,
    /// even when they carry the cluster's labels.
    pub fn from_lists(
        cluster: &str,
        services: Vec<Service>,
        config_maps: Vec<ConfigMap>,
        claims: Vec<PersistentVolumeClaim>,
        pods: Vec<Pod>,
    ) -> Self {
        let service_name = discovery_service_name(cluster);
        let peers_name = peers_config_map_name(cluster);
        let claim_prefix = claim_prefix(cluster);

        Self {
            service: services.into_iter().find(|s| s.name_any() == service_name),
            peers: config_maps.into_iter().find(|c| c.name_any() == peers_name),
            claims: claims
                .into_iter()
                .filter_map(|c| parse_ordinal(&claim_prefix, &c.name_any()).map(|i| (i, c)))
                .collect(),
            replicas: pods
                .into_iter()
                .filter_map(|p| parse_ordinal(cluster, &p.name_any()).map(|i| (i, p)))
                .collect(),
        }
    }

    /// Total number of observed child objects
    pub fn len(&self) -> usize {
        usize::from(self.service.is_some())
            + usize::from(self.peers.is_some())
            + self.claims.len()
            + self.replicas.len()
    }

    /// True when the cluster owns nothing yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Access to the Kubernetes API for one reconciliation pass.
///
/// Implementations bound every call with a timeout and report it as
/// [`Error::Timeout`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fetch a cluster; `None` when it does not exist
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<AuthCluster>, Error>;

    /// List every child currently labelled as belonging to `cluster`
    async fn list_children(&self, namespace: &str, cluster: &str)
        -> Result<ObservedChildren, Error>;

    /// Create a child. Fails with AlreadyExists when the name is taken.
    async fn create(&self, child: &ChildResource) -> Result<(), Error>;

    /// Bring an existing child in line with `child` (server-side apply)
    async fn patch(&self, child: &ChildResource) -> Result<(), Error>;

    /// Take over the live object named like `child`.
    ///
    /// Only metadata changes: the object gets `child`'s labels and owner
    /// references, so later listings see it. Its contents are left for the
    /// next pass to diff. Fails with NotFound when nothing has that name.
    async fn adopt(&self, child: &ChildResource) -> Result<(), Error>;

    /// Delete a child. Fails with NotFound when it is already gone.
    async fn delete(&self, kind: ChildKind, namespace: &str, name: &str) -> Result<(), Error>;

    /// Write status, conditional on the cluster's `resourceVersion`.
    ///
    /// Fails with Conflict when the cluster changed since it was read.
    async fn replace_status(
        &self,
        cluster: &AuthCluster,
        status: &AuthClusterStatus,
    ) -> Result<(), Error>;
}
