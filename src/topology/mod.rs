//! Peer topology resolution
//!
//! Every replica of a cluster gets a stable DNS name derived from the cluster
//! name and its ordinal. Nodes read the rendered peer list and build identical
//! membership views without talking to each other first, so the mapping from
//! ordinal to address must never depend on call order or process state.

use std::fmt;

/// Network address of one cluster member
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    /// Replica ordinal in `[0, replicas)`
    pub ordinal: u32,
    /// Fully qualified host name
    pub host: String,
    /// Listen port
    pub port: u16,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// DNS layout shared by every member of one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerTopology {
    /// Headless service that publishes per-replica DNS records
    pub service: String,
    /// Namespace of the cluster
    pub namespace: String,
    /// Cluster DNS suffix (e.g. `svc.cluster.local`)
    pub domain: String,
    /// Port every member listens on
    pub port: u16,
}

impl PeerTopology {
    /// Create a topology description
    pub fn new(
        service: impl Into<String>,
        namespace: impl Into<String>,
        domain: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            domain: domain.into(),
            port,
        }
    }

    /// Address of a single ordinal
    pub fn address(&self, base_name: &str, ordinal: u32) -> PeerAddress {
        PeerAddress {
            ordinal,
            host: format!(
                "{}.{}.{}.{}",
                replica_name(base_name, ordinal),
                self.service,
                self.namespace,
                self.domain
            ),
            port: self.port,
        }
    }

    /// Addresses of ordinals `0..replicas`, in ordinal order
    pub fn resolve(&self, base_name: &str, replicas: u32) -> Vec<PeerAddress> {
        (0..replicas)
            .map(|ordinal| self.address(base_name, ordinal))
            .collect()
    }
}

/// Name of the replica with the given ordinal
pub fn replica_name(base_name: &str, ordinal: u32) -> String {
    format!("{}-{}", base_name, ordinal)
}

/// Recover the ordinal from a name produced by `format!("{prefix}-{ordinal}")`
///
/// Returns `None` for names that do not carry a canonical ordinal suffix
/// (leading zeros, signs and empty suffixes are rejected).
pub fn parse_ordinal(prefix: &str, name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(prefix)?.strip_prefix('-')?;
    if suffix.is_empty()
        || !suffix.bytes().all(|b| b.is_ascii_digit())
        || (suffix.len() > 1 && suffix.starts_with('0'))
    {
        return None;
    }
    suffix.parse().ok()
}

/// Render the peer list artifact: one `host:port` line per member
pub fn render_peer_list(peers: &[PeerAddress]) -> String {
    peers
        .iter()
        .map(|p| format!("{}\n", p))
        .collect::<String>()
}
