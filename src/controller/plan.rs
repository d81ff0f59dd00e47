//! Diff between desired and observed children
//!
//! [`plan`] is pure: given what the compiler wants and what the API server
//! reported, it returns the ordered writes for one pass. The engine executes
//! them in order and stops at the first hard failure, so the order encodes the
//! safety rules:
//!
//! 1. Excess replicas go first (descending ordinal), then their claims.
//! 2. The peer list is only rewritten once every surviving replica is ready.
//! 3. New replicas are only created once the peer list they read is current.
//! 4. At most one divergent replica is replaced per pass, highest ordinal
//!    first, and only while every other replica is ready.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::compiler::{parse_quantity, DesiredState, SPEC_HASH_ANNOTATION};
use crate::gateway::{ChildKind, ChildResource, ObservedChildren};
use crate::status::{is_pod_finished, is_pod_ready};

/// One write against the API server
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Create a missing child
    Create(ChildResource),
    /// Bring a divergent child back in line
    Patch(ChildResource),
    /// Remove a child
    Delete {
        /// Kind of the child
        kind: ChildKind,
        /// Name of the child
        name: String,
        /// Ordinal for per-replica children
        ordinal: Option<u32>,
    },
}

impl Step {
    /// Kind of the child this step touches
    pub fn kind(&self) -> ChildKind {
        match self {
            Step::Create(c) | Step::Patch(c) => c.kind(),
            Step::Delete { kind, .. } => *kind,
        }
    }

    /// Name of the child this step touches
    pub fn name(&self) -> &str {
        match self {
            Step::Create(c) | Step::Patch(c) => c.name(),
            Step::Delete { name, .. } => name,
        }
    }
}

/// Ordered writes for one pass plus what the engine should do afterwards
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    /// Writes, in execution order
    pub steps: Vec<Step>,
    /// Work that can proceed as soon as these steps land (e.g. recreating
    /// a replica deleted for replacement)
    pub follow_up: bool,
    /// Reasons the plan held back work until replicas become ready
    pub waiting: Vec<String>,
}

impl Plan {
    /// True when observed state already matches desired state
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Ordinals of replicas this plan deletes
    pub fn removed_replicas(&self) -> BTreeSet<u32> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Delete {
                    kind: ChildKind::Replica,
                    ordinal,
                    ..
                } => *ordinal,
                _ => None,
            })
            .collect()
    }

    fn delete(&mut self, kind: ChildKind, meta: &ObjectMeta, ordinal: u32) {
        self.steps.push(Step::Delete {
            kind,
            name: meta.name.clone().unwrap_or_default(),
            ordinal: Some(ordinal),
        });
    }
}

/// Compute the writes that move `observed` towards `desired`
pub fn plan(desired: &DesiredState, observed: &ObservedChildren) -> Plan {
    let mut plan = Plan::default();
    let wanted = desired.replicas_wanted;

    // Discovery service
    match &observed.service {
        None => plan
            .steps
            .push(Step::Create(ChildResource::Service(desired.service.clone()))),
        Some(live) if service_diverges(&desired.service, live) => plan
            .steps
            .push(Step::Patch(ChildResource::Service(desired.service.clone()))),
        Some(_) => {}
    }

    // Scale-down: replicas first, then their claims, both descending
    for (&ordinal, pod) in observed.replicas.range(wanted..).rev() {
        if !is_terminating(&pod.metadata) {
            plan.delete(ChildKind::Replica, &pod.metadata, ordinal);
        }
    }
    for (&ordinal, claim) in observed.claims.range(wanted..).rev() {
        if !is_terminating(&claim.metadata) {
            plan.delete(ChildKind::Claim, &claim.metadata, ordinal);
        }
    }

    // Replicas that exited for good are recreated on the next pass
    for (&ordinal, pod) in observed.replicas.range(..wanted).rev() {
        if is_pod_finished(pod) && !is_terminating(&pod.metadata) {
            plan.delete(ChildKind::Replica, &pod.metadata, ordinal);
            plan.follow_up = true;
        }
    }
    let removed = plan.removed_replicas();

    // Survivors: replicas below the desired count that outlive this pass
    let survivors: Vec<(u32, &Pod)> = observed
        .replicas
        .range(..wanted)
        .filter(|(ordinal, _)| !removed.contains(ordinal))
        .map(|(&ordinal, pod)| (ordinal, pod))
        .collect();
    let unready: Vec<u32> = survivors
        .iter()
        .filter(|(_, pod)| !is_pod_ready(pod))
        .map(|(ordinal, _)| *ordinal)
        .collect();

    // Peer list
    let peers_current = match &observed.peers {
        None => {
            plan.steps
                .push(Step::Create(ChildResource::PeerList(desired.peers.clone())));
            true
        }
        Some(live) if peers_diverge(&desired.peers, live) => {
            if unready.is_empty() {
                plan.steps
                    .push(Step::Patch(ChildResource::PeerList(desired.peers.clone())));
                true
            } else {
                plan.waiting.push(format!(
                    "peer list update waits for replicas {:?} to become ready",
                    unready
                ));
                false
            }
        }
        Some(_) => true,
    };

    // Claims come before the replicas that mount them
    for (ordinal, claim) in (0..wanted).zip(&desired.claims) {
        match observed.claims.get(&ordinal) {
            None => plan
                .steps
                .push(Step::Create(ChildResource::Claim(claim.clone()))),
            Some(live) if claim_needs_expansion(claim, live) => plan
                .steps
                .push(Step::Patch(ChildResource::Claim(claim_expansion(claim)))),
            Some(_) => {}
        }
    }

    // Missing replicas
    let missing: Vec<u32> = (0..wanted)
        .filter(|ordinal| !observed.replicas.contains_key(ordinal))
        .collect();
    if !missing.is_empty() {
        if peers_current {
            for ordinal in &missing {
                if let Some(pod) = desired.replicas.get(*ordinal as usize) {
                    plan.steps
                        .push(Step::Create(ChildResource::Replica(pod.clone())));
                }
            }
        } else {
            plan.waiting
                .push(format!("replicas {:?} wait for the peer list", missing));
        }
    }

    // Rolling replacement of divergent replicas
    let divergent: Vec<(u32, &Pod)> = survivors
        .iter()
        .rev()
        .filter(|(ordinal, pod)| {
            desired
                .replicas
                .get(*ordinal as usize)
                .is_some_and(|want| replica_diverges(want, pod))
        })
        .copied()
        .collect();
    if let Some(&(ordinal, pod)) = divergent.first() {
        let others_ready = missing.is_empty()
            && removed.iter().all(|o| *o >= wanted)
            && survivors
                .iter()
                .all(|(other, p)| *other == ordinal || is_pod_ready(p));
        if others_ready && !is_terminating(&pod.metadata) {
            plan.delete(ChildKind::Replica, &pod.metadata, ordinal);
            plan.follow_up = true;
        } else {
            plan.waiting.push(format!(
                "replacement of replica {} waits for the other replicas",
                ordinal
            ));
        }
    }

    plan
}

fn is_terminating(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// True when the live Service's selector or ports differ from the desired ones
pub fn service_diverges(desired: &Service, live: &Service) -> bool {
    let (Some(want), Some(have)) = (desired.spec.as_ref(), live.spec.as_ref()) else {
        return desired.spec.is_some();
    };
    let ports = |spec: &k8s_openapi::api::core::v1::ServiceSpec| {
        spec.ports
            .iter()
            .flatten()
            .map(|p| (p.name.clone(), p.port, p.target_port.clone()))
            .collect::<Vec<_>>()
    };
    want.selector != have.selector
        || ports(want) != ports(have)
        || want.publish_not_ready_addresses != have.publish_not_ready_addresses
}

/// True when the live peer list differs from the desired one
pub fn peers_diverge(desired: &ConfigMap, live: &ConfigMap) -> bool {
    desired.data != live.data
}

/// True when the live claim requests less storage than desired.
///
/// Claims are never shrunk; an unparseable live request is left alone.
pub fn claim_needs_expansion(
    desired: &PersistentVolumeClaim,
    live: &PersistentVolumeClaim,
) -> bool {
    match (requested_bytes(desired), requested_bytes(live)) {
        (Some(want), Some(have)) => have < want,
        _ => false,
    }
}

fn requested_bytes(claim: &PersistentVolumeClaim) -> Option<u128> {
    let quantity = claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")?;
    parse_quantity(&quantity.0)
}

/// Apply body that only touches the storage request
fn claim_expansion(desired: &PersistentVolumeClaim) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: desired.metadata.name.clone(),
            namespace: desired.metadata.namespace.clone(),
            labels: desired.metadata.labels.clone(),
            owner_references: desired.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: desired.spec.as_ref().map(|spec| {
            k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
                resources: spec.resources.clone(),
                ..Default::default()
            }
        }),
        ..Default::default()
    }
}

/// True when the live Pod was built from a different template
pub fn replica_diverges(desired: &Pod, live: &Pod) -> bool {
    let hash = |pod: &Pod| pod.annotations().get(SPEC_HASH_ANNOTATION).cloned();
    hash(desired) != hash(live)
}
