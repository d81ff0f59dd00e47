//! Custom Resource Definitions for the AuthCluster operator

mod cluster;
mod types;

pub use cluster::{
    AuthCluster, AuthClusterSpec, AuthClusterStatus, MAX_CLUSTER_NAME_LEN,
    MAX_NODE_COUNT,
};
pub use types::{ClusterPhase, Condition, ConditionStatus};
