//! Status Reporter
//!
//! Computes `readyNodes` from observed replicas and persists status with
//! optimistic concurrency. A status write that loses a race is retried on its
//! own schedule and never fails the reconciliation pass that produced it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::crd::{AuthCluster, AuthClusterStatus, ClusterPhase, Condition, ConditionStatus};
use crate::gateway::PlatformClient;
use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::Error;

/// Condition type reported on every AuthCluster
pub const READY_CONDITION: &str = "Ready";

/// True when the Pod is not terminating and its Ready condition is True
pub fn is_pod_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// True when the Pod's containers have stopped for good
pub fn is_pod_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Failed") | Some("Succeeded")
    )
}

/// Number of ready replicas with ordinal below `node_count`, never above it
pub fn count_ready(replicas: &BTreeMap<u32, Pod>, node_count: u32) -> i32 {
    let ready = replicas
        .range(..node_count)
        .filter(|(_, pod)| is_pod_ready(pod))
        .count();
    i32::try_from(ready).unwrap_or(i32::MAX)
}

/// Status for a cluster whose children are still being created or awaited
pub fn converging(
    cluster: &AuthCluster,
    ready: i32,
    message: impl Into<String>,
) -> AuthClusterStatus {
    let message = message.into();
    AuthClusterStatus::with_phase(ClusterPhase::Converging)
        .ready_nodes(ready)
        .observed_generation(cluster.metadata.generation)
        .message(message.clone())
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            "Converging",
            message,
        ))
}

/// Status for a cluster whose every desired replica is ready
pub fn converged(cluster: &AuthCluster, ready: i32) -> AuthClusterStatus {
    let message = format!("{}/{} nodes ready", ready, cluster.spec.node_count);
    AuthClusterStatus::with_phase(ClusterPhase::Converged)
        .ready_nodes(ready)
        .observed_generation(cluster.metadata.generation)
        .message(message.clone())
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::True,
            "Converged",
            message,
        ))
}

/// Status for a cluster whose spec was rejected
///
/// `readyNodes` keeps its last reported value, since invalid specs do not
/// touch children. It is clamped to the rejected `nodeCount` (zero when
/// negative) so it never reports more nodes than the spec asks for.
pub fn degraded(cluster: &AuthCluster, error: &Error) -> AuthClusterStatus {
    let last = cluster.status.as_ref().map_or(0, |s| s.ready_nodes);
    let ready = last.min(cluster.spec.node_count.max(0));
    AuthClusterStatus::with_phase(ClusterPhase::Degraded)
        .ready_nodes(ready)
        .observed_generation(cluster.metadata.generation)
        .message(error.to_string())
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            error.reason(),
            error.to_string(),
        ))
}

/// Persists status for one reconciliation pass
pub struct StatusReporter<'a> {
    client: &'a dyn PlatformClient,
    retry: &'a RetryConfig,
}

impl<'a> StatusReporter<'a> {
    /// Create a reporter writing through `client`
    pub fn new(client: &'a dyn PlatformClient, retry: &'a RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Write `status` unless the cluster already reports the same state.
    ///
    /// Returns whether a write happened. Conflicts re-fetch the cluster and
    /// retry; a cluster deleted in the meantime is not an error.
    pub async fn publish(
        &self,
        cluster: &AuthCluster,
        status: &AuthClusterStatus,
    ) -> Result<bool, Error> {
        let attempt = AtomicU32::new(0);
        retry_with_backoff_if(
            self.retry,
            "update AuthCluster status",
            |e: &Error| e.is_conflict(),
            || self.write_once(cluster, status, &attempt),
        )
        .await
    }

    async fn write_once(
        &self,
        cluster: &AuthCluster,
        status: &AuthClusterStatus,
        attempt: &AtomicU32,
    ) -> Result<bool, Error> {
        let current = if attempt.fetch_add(1, Ordering::Relaxed) == 0 {
            Some(cluster.clone())
        } else {
            let namespace = cluster.namespace().unwrap_or_default();
            self.client
                .get_cluster(&namespace, &cluster.name_any())
                .await?
        };
        let Some(current) = current else {
            debug!("cluster disappeared before status write");
            return Ok(false);
        };

        let status = status
            .clone()
            .inherit_transition_times(current.status.as_ref());
        if current
            .status
            .as_ref()
            .is_some_and(|existing| existing.same_state(&status))
        {
            return Ok(false);
        }

        self.client.replace_status(&current, &status).await?;
        Ok(true)
    }

    /// Like [`publish`](Self::publish), but a failure is logged instead of
    /// returned so the pass can finish and requeue normally.
    pub async fn publish_best_effort(
        &self,
        cluster: &AuthCluster,
        status: &AuthClusterStatus,
    ) -> bool {
        match self.publish(cluster, status).await {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, phase = %status.phase, "failed to update status");
                false
            }
        }
    }
}
