//! Operator configuration
//!
//! Everything the compiler and engine need that is not part of an
//! `AuthCluster` spec. Built once by the binary from CLI flags and
//! environment variables and shared read-only through the controller context.

use std::time::Duration;

use crate::{DEFAULT_CLUSTER_DOMAIN, DEFAULT_NODE_IMAGE, DEFAULT_NODE_PORT, DEFAULT_STORAGE_SIZE};

/// Static settings applied to every reconciled cluster
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Container image for auth nodes
    pub image: String,
    /// Image pull policy for auth nodes (e.g. IfNotPresent, Never)
    pub image_pull_policy: String,
    /// Port every node listens on; also used in peer addresses
    pub node_port: u16,
    /// Capacity requested by each replica's claim
    pub storage_size: String,
    /// StorageClass for claims (cluster default when unset)
    pub storage_class: Option<String>,
    /// DNS suffix after the namespace in peer addresses
    pub cluster_domain: String,
    /// Deadline for every individual API call
    pub api_timeout: Duration,
    /// Periodic resync interval for converged clusters
    pub resync_interval: Duration,
    /// First requeue delay while waiting for replicas to become ready
    pub readiness_backoff_initial: Duration,
    /// Upper bound for the readiness requeue delay
    pub readiness_backoff_max: Duration,
    /// First requeue delay after a failed reconcile
    pub error_backoff_initial: Duration,
    /// Upper bound for the failed-reconcile requeue delay
    pub error_backoff_max: Duration,
    /// Attempts for a status write that keeps hitting conflicts
    pub status_retry_attempts: u32,
    /// Maximum number of clusters reconciled in parallel (0 = unbounded)
    pub concurrency: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_NODE_IMAGE.to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            node_port: DEFAULT_NODE_PORT,
            storage_size: DEFAULT_STORAGE_SIZE.to_string(),
            storage_class: None,
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            api_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
            readiness_backoff_initial: Duration::from_secs(2),
            readiness_backoff_max: Duration::from_secs(60),
            error_backoff_initial: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(300),
            status_retry_attempts: 5,
            concurrency: 8,
        }
    }
}

impl ControllerConfig {
    /// Reject settings that would make every reconcile fail
    pub fn validate(&self) -> crate::Result<()> {
        if self.image.trim().is_empty() {
            return Err(crate::Error::validation("node image must not be empty"));
        }
        if self.node_port == 0 {
            return Err(crate::Error::validation("node port must be non-zero"));
        }
        if crate::compiler::parse_quantity(&self.storage_size).is_none() {
            return Err(crate::Error::validation(format!(
                "storage size '{}' is not a valid quantity",
                self.storage_size
            )));
        }
        if self.api_timeout.is_zero() {
            return Err(crate::Error::validation("api timeout must be non-zero"));
        }
        Ok(())
    }
}
