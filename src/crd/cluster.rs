//! AuthCluster Custom Resource Definition
//!
//! An AuthCluster declares a group of authentication nodes that share a
//! coordination store and discover each other through a generated peer list.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterPhase, Condition};

/// Longest cluster name whose derived child names stay valid DNS labels.
///
/// `{name}-headless` is the longest generated name and must fit in 63 chars.
pub const MAX_CLUSTER_NAME_LEN: usize = 63 - "-headless".len();

/// Largest accepted `nodeCount`.
///
/// Keeps the rendered peer list well inside the 1 MiB ConfigMap limit even
/// with the longest cluster and namespace names.
pub const MAX_NODE_COUNT: i32 = 1000;

/// Specification for an AuthCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "auth.goosefuse.dev",
    version = "v1",
    kind = "AuthCluster",
    plural = "authclusters",
    shortname = "ac",
    status = "AuthClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".spec.nodeCount"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyNodes"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AuthClusterSpec {
    /// Desired number of auth nodes
    #[schemars(range(min = 0, max = 1000))]
    pub node_count: i32,

    /// Connection string of the shared coordination store
    #[serde(rename = "storeURL", alias = "redisURL")]
    pub store_url: String,
}

impl AuthClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.node_count < 0 {
            return Err(crate::Error::validation(format!(
                "nodeCount must be >= 0, got {}",
                self.node_count
            )));
        }
        if self.node_count > MAX_NODE_COUNT {
            return Err(crate::Error::validation(format!(
                "nodeCount must be <= {}, got {}",
                MAX_NODE_COUNT, self.node_count
            )));
        }

        if self.store_url.trim().is_empty() {
            return Err(crate::Error::validation("storeURL must not be empty"));
        }

        Ok(())
    }

    /// Desired replica count; only meaningful after [`validate`](Self::validate)
    pub fn replicas(&self) -> u32 {
        u32::try_from(self.node_count).unwrap_or(0)
    }
}

impl AuthCluster {
    /// Validate both the spec and the identity the children are named after
    pub fn validate(&self) -> Result<(), crate::Error> {
        let name = self.name_any();
        if name.len() > MAX_CLUSTER_NAME_LEN {
            return Err(crate::Error::validation(format!(
                "cluster name '{}' is longer than {} characters",
                name, MAX_CLUSTER_NAME_LEN
            )));
        }
        self.spec.validate()
    }

    /// Phase recorded by the last status write, if any
    pub fn phase(&self) -> Option<ClusterPhase> {
        self.status.as_ref().map(|s| s.phase)
    }

    /// True when status already records Degraded for the current generation
    ///
    /// A spec edit bumps `metadata.generation`, which re-enables reconciliation.
    pub fn is_degraded_at_current_generation(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.phase == ClusterPhase::Degraded && s.observed_generation == self.metadata.generation
        })
    }
}

/// Status for an AuthCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthClusterStatus {
    /// Number of replicas reporting ready
    #[serde(default)]
    pub ready_nodes: i32,

    /// Current reconciliation phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl AuthClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the ready node count and return self for chaining
    pub fn ready_nodes(mut self, ready: i32) -> Self {
        self.ready_nodes = ready;
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        // Remove existing condition of the same type
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Keep the previous transition time for conditions that did not change
    pub fn inherit_transition_times(mut self, previous: Option<&AuthClusterStatus>) -> Self {
        let Some(previous) = previous else {
            return self;
        };
        for condition in &mut self.conditions {
            if let Some(old) = previous
                .conditions
                .iter()
                .find(|old| old.same_state(condition))
            {
                condition.last_transition_time = old.last_transition_time;
            }
        }
        self
    }

    /// Equal in everything but condition timestamps
    pub fn same_state(&self, other: &AuthClusterStatus) -> bool {
        self.ready_nodes == other.ready_nodes
            && self.phase == other.phase
            && self.observed_generation == other.observed_generation
            && self.message == other.message
            && self.conditions.len() == other.conditions.len()
            && self
                .conditions
                .iter()
                .zip(&other.conditions)
                .all(|(a, b)| a.same_state(b))
    }
}
