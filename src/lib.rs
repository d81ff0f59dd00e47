//! AuthCluster operator - CRD-driven lifecycle management for auth-node clusters
//!
//! An `AuthCluster` declares how many authentication nodes should run and which
//! coordination store they share. The operator turns that declaration into a
//! set of owned child resources and keeps them convergent.
//!
//! # Architecture
//!
//! - Each replica is a Pod with a stable ordinal identity (`{cluster}-{i}`)
//! - Each replica owns a single-writer PersistentVolumeClaim (`{cluster}-pvc-{i}`)
//! - Replicas discover each other through a peer list ConfigMap (`{cluster}-peers`)
//!   and a headless Service that gives every ordinal a stable DNS name
//! - Every child carries a controller owner reference, so deleting the
//!   `AuthCluster` cascades through the Kubernetes garbage collector
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definition (AuthCluster)
//! - [`topology`] - Deterministic peer address resolution
//! - [`compiler`] - Desired child-resource compilation
//! - [`status`] - Ready-replica accounting and status persistence
//! - [`gateway`] - Kubernetes API access behind a mockable trait
//! - [`controller`] - Reconciliation engine and controller runner
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Exponential backoff helpers
//! - [`config`] - Operator configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod compiler;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod gateway;
pub mod retry;
pub mod status;
pub mod topology;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "authcluster-controller";

/// Default port every auth node listens on for peer and client traffic
pub const DEFAULT_NODE_PORT: u16 = 6333;

/// Default container image for auth nodes
pub const DEFAULT_NODE_IMAGE: &str = "distributed-auth-system:latest";

/// Default capacity requested by each replica's storage claim
pub const DEFAULT_STORAGE_SIZE: &str = "1Gi";

/// Default DNS suffix appended after the namespace in peer addresses
pub const DEFAULT_CLUSTER_DOMAIN: &str = "svc.cluster.local";
