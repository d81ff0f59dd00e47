//! Desired State Compiler
//!
//! Turns an [`AuthCluster`] into the complete set of child resources it
//! should own:
//!
//! - a headless Service `{cluster}-headless` giving each replica a DNS name
//! - a peer list ConfigMap `{cluster}-peers` with key `peers.conf`
//! - one claim `{cluster}-pvc-{i}` per replica
//! - one Pod `{cluster}-{i}` per replica
//!
//! Compilation is pure: the same cluster and configuration always produce
//! byte-identical output. Nothing here reads the clock or talks to the API
//! server, which is what lets the engine detect drift by comparison.
//!
//! # Usage
//!
//! ```text
//! let compiler = StateCompiler::new(&config);
//! let desired = compiler.compile(&cluster)?;
//! // desired.service, desired.peers, desired.claims, desired.replicas
//! ```

mod quantity;
mod replica;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::config::ControllerConfig;
use crate::crd::AuthCluster;
use crate::topology::{render_peer_list, replica_name, PeerAddress, PeerTopology};
use crate::Error;

pub use quantity::parse_quantity;
pub use replica::{ENV_NODE_ID, ENV_PEER_LIST, ENV_PORT, ENV_REDIS_URL, ENV_STORE_URL};

// =============================================================================
// Labels and names
// =============================================================================

/// Label carrying the workload identity shared by every auth node
pub const APP_LABEL: &str = "app";
/// Value of [`APP_LABEL`]
pub const APP_NAME: &str = "auth-node";
/// Label carrying the owning cluster's name
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Label marking children created by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "authcluster-operator";
/// Label carrying a replica's ordinal (Pods and claims)
pub const ORDINAL_LABEL: &str = "auth.goosefuse.dev/ordinal";
/// Annotation carrying the hash of a replica's template
pub const SPEC_HASH_ANNOTATION: &str = "auth.goosefuse.dev/spec-hash";

/// Key of the peer list inside the peers ConfigMap
pub const PEERS_KEY: &str = "peers.conf";
/// Name of the auth node container
pub const CONTAINER_NAME: &str = "authnode";
/// Volume backed by the replica's claim
pub const DATA_VOLUME: &str = "data";
/// Mount path of [`DATA_VOLUME`]
pub const DATA_MOUNT_PATH: &str = "/app/data";
/// Volume projecting the peer list
pub const PEERS_VOLUME: &str = "peers";
/// Mount path of [`PEERS_VOLUME`]
pub const PEERS_MOUNT_PATH: &str = "/etc/authnode";

/// Name of the headless Service publishing replica DNS records
pub fn discovery_service_name(cluster: &str) -> String {
    format!("{}-headless", cluster)
}

/// Name of the peer list ConfigMap
pub fn peers_config_map_name(cluster: &str) -> String {
    format!("{}-peers", cluster)
}

/// Prefix shared by every claim of a cluster; `{prefix}-{i}` is a claim name
pub fn claim_prefix(cluster: &str) -> String {
    format!("{}-pvc", cluster)
}

/// Name of the claim backing replica `ordinal`
pub fn claim_name(cluster: &str, ordinal: u32) -> String {
    replica_name(&claim_prefix(cluster), ordinal)
}

/// Labels the discovery Service selects replicas by
pub fn selector_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (INSTANCE_LABEL.to_string(), cluster.to_string()),
    ])
}

/// Labels carried by every child of a cluster
pub fn child_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cluster);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

/// Label selector matching every child of a cluster
pub fn child_selector(cluster: &str) -> String {
    format!(
        "{}={},{}={}",
        INSTANCE_LABEL, cluster, MANAGED_BY_LABEL, MANAGED_BY
    )
}

/// Compute a deterministic hash of the input string.
///
/// Returns the first 16 hex characters of the SHA-256 digest.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Make `parent` the controller owner of the object described by `meta`.
///
/// Any existing controller reference is replaced; non-controller owners are
/// kept. Fails when the parent has not been persisted yet (no uid).
pub fn set_owner_reference(meta: &mut ObjectMeta, parent: &AuthCluster) -> crate::Result<()> {
    let owner = parent
        .controller_owner_ref(&())
        .ok_or_else(|| Error::missing_field("metadata.uid"))?;
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.controller != Some(true));
    refs.push(owner);
    Ok(())
}

// =============================================================================
// Compiled output
// =============================================================================

/// Every child a cluster should own, in ordinal order
#[derive(Clone, Debug)]
pub struct DesiredState {
    /// Desired replica count
    pub replicas_wanted: u32,
    /// Headless discovery Service
    pub service: Service,
    /// Peer list ConfigMap
    pub peers: ConfigMap,
    /// Claims, indexed by ordinal
    pub claims: Vec<PersistentVolumeClaim>,
    /// Replica Pods, indexed by ordinal
    pub replicas: Vec<Pod>,
}

impl DesiredState {
    /// Rendered peer list as stored in the ConfigMap
    pub fn peer_list(&self) -> &str {
        self.peers
            .data
            .as_ref()
            .and_then(|d| d.get(PEERS_KEY))
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Total number of child objects
    pub fn resource_count(&self) -> usize {
        2 + self.claims.len() + self.replicas.len()
    }
}

/// Compiles AuthCluster resources into their desired children
pub struct StateCompiler<'a> {
    config: &'a ControllerConfig,
}

impl<'a> StateCompiler<'a> {
    /// Create a compiler bound to the operator configuration
    pub fn new(config: &'a ControllerConfig) -> Self {
        Self { config }
    }

    /// DNS layout for a cluster in `namespace`
    pub fn topology(&self, cluster: &str, namespace: &str) -> PeerTopology {
        PeerTopology::new(
            discovery_service_name(cluster),
            namespace,
            self.config.cluster_domain.clone(),
            self.config.node_port,
        )
    }

    /// Compile the full desired child set.
    ///
    /// Rejects invalid specs before producing anything. The cluster must have
    /// been read from the API server (namespace and uid set).
    pub fn compile(&self, cluster: &AuthCluster) -> crate::Result<DesiredState> {
        cluster.validate()?;

        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::missing_field("metadata.namespace"))?;
        let replicas_wanted = cluster.spec.replicas();

        let peer_addresses = self
            .topology(&name, &namespace)
            .resolve(&name, replicas_wanted);

        let mut service = self.discovery_service(&name, &namespace);
        set_owner_reference(&mut service.metadata, cluster)?;

        let mut peers = self.peer_config_map(&name, &namespace, &peer_addresses);
        set_owner_reference(&mut peers.metadata, cluster)?;

        let mut claims = Vec::with_capacity(replicas_wanted as usize);
        let mut replicas = Vec::with_capacity(replicas_wanted as usize);
        for ordinal in 0..replicas_wanted {
            let mut claim = replica::build_claim(self.config, &name, &namespace, ordinal);
            set_owner_reference(&mut claim.metadata, cluster)?;
            claims.push(claim);

            let mut pod = replica::build_replica(
                self.config,
                &name,
                &namespace,
                &cluster.spec.store_url,
                ordinal,
            )?;
            set_owner_reference(&mut pod.metadata, cluster)?;
            replicas.push(pod);
        }

        Ok(DesiredState {
            replicas_wanted,
            service,
            peers,
            claims,
            replicas,
        })
    }

    fn discovery_service(&self, cluster: &str, namespace: &str) -> Service {
        let port = i32::from(self.config.node_port);
        Service {
            metadata: ObjectMeta {
                name: Some(discovery_service_name(cluster)),
                namespace: Some(namespace.to_string()),
                labels: Some(child_labels(cluster)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                // Peers must resolve each other before any of them is ready
                publish_not_ready_addresses: Some(true),
                selector: Some(selector_labels(cluster)),
                ports: Some(vec![ServicePort {
                    name: Some("auth".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn peer_config_map(&self, cluster: &str, namespace: &str, peers: &[PeerAddress]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(peers_config_map_name(cluster)),
                namespace: Some(namespace.to_string()),
                labels: Some(child_labels(cluster)),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                PEERS_KEY.to_string(),
                render_peer_list(peers),
            )])),
            ..Default::default()
        }
    }
}
