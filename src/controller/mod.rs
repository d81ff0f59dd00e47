//! Reconciliation for AuthCluster resources
//!
//! [`plan`] turns desired and observed children into an ordered list of
//! writes, [`cluster`](reconcile) executes one pass and reports status, and
//! [`runner`] wires both into a `kube` controller with owned-kind watches.

mod cluster;
pub mod plan;
pub mod registry;
pub mod runner;

pub use cluster::{error_policy, reconcile, Context, ContextBuilder, ReconcileOutcome};
pub use plan::{plan, Plan, Step};
pub use registry::{ChildKindEntry, ChildKindRegistry};
pub use runner::{build_controller, WATCH_TIMEOUT_SECS};
