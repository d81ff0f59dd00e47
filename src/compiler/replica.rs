//! Per-replica children: the auth node Pod and its storage claim

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, Probe, TCPSocketAction, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{
    child_labels, claim_name, deterministic_hash, discovery_service_name, peers_config_map_name,
    CONTAINER_NAME, DATA_MOUNT_PATH, DATA_VOLUME, ORDINAL_LABEL, PEERS_KEY, PEERS_MOUNT_PATH,
    PEERS_VOLUME, SPEC_HASH_ANNOTATION,
};
use crate::config::ControllerConfig;
use crate::topology::replica_name;

/// Environment variable carrying the node's own identity (its Pod name)
pub const ENV_NODE_ID: &str = "NODE_ID";
/// Environment variable carrying the coordination store address
pub const ENV_STORE_URL: &str = "STORE_URL";
/// Same address under the name existing auth-node images read
pub const ENV_REDIS_URL: &str = "REDIS_URL";
/// Environment variable carrying the rendered peer list
pub const ENV_PEER_LIST: &str = "PEER_LIST";
/// Environment variable carrying the listen port
pub const ENV_PORT: &str = "PORT";

const STORAGE_ACCESS_MODE: &str = "ReadWriteOnce";

/// Build the claim backing replica `ordinal`
pub(super) fn build_claim(
    config: &ControllerConfig,
    cluster: &str,
    namespace: &str,
    ordinal: u32,
) -> PersistentVolumeClaim {
    let mut labels = child_labels(cluster);
    labels.insert(ORDINAL_LABEL.to_string(), ordinal.to_string());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name(cluster, ordinal)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![STORAGE_ACCESS_MODE.to_string()]),
            storage_class_name: config.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(config.storage_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the Pod for replica `ordinal`, annotated with a hash of its template
pub(super) fn build_replica(
    config: &ControllerConfig,
    cluster: &str,
    namespace: &str,
    store_url: &str,
    ordinal: u32,
) -> crate::Result<Pod> {
    let name = replica_name(cluster, ordinal);
    let mut labels = child_labels(cluster);
    labels.insert(ORDINAL_LABEL.to_string(), ordinal.to_string());

    let spec = PodSpec {
        hostname: Some(name.clone()),
        subdomain: Some(discovery_service_name(cluster)),
        restart_policy: Some("Always".to_string()),
        containers: vec![node_container(config, cluster, store_url)],
        volumes: Some(vec![
            Volume {
                name: DATA_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name(cluster, ordinal),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: PEERS_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: peers_config_map_name(cluster),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let template = serde_json::to_string(&(&labels, &spec))?;
    let annotations = BTreeMap::from([(
        SPEC_HASH_ANNOTATION.to_string(),
        deterministic_hash(&template),
    )]);

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    })
}

fn node_container(config: &ControllerConfig, cluster: &str, store_url: &str) -> Container {
    let port = i32::from(config.node_port);

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        env: Some(vec![
            EnvVar {
                name: ENV_NODE_ID.to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: ENV_STORE_URL.to_string(),
                value: Some(store_url.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: ENV_REDIS_URL.to_string(),
                value: Some(store_url.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: ENV_PEER_LIST.to_string(),
                value_from: Some(EnvVarSource {
                    config_map_key_ref: Some(ConfigMapKeySelector {
                        name: peers_config_map_name(cluster),
                        key: PEERS_KEY.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: ENV_PORT.to_string(),
                value: Some(config.node_port.to_string()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("auth".to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: PEERS_VOLUME.to_string(),
                mount_path: PEERS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(2),
            period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    }
}
