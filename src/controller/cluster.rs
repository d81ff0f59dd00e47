//! AuthCluster controller implementation
//!
//! Level-triggered reconciliation: every pass re-reads the cluster, compiles
//! the desired children, diffs them against what exists and applies the
//! difference. Nothing is remembered between passes except backoff counters,
//! so a restart at any point resumes from observed state.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::plan::{plan, Plan, Step};
use super::registry::ChildKindRegistry;
use crate::compiler::StateCompiler;
use crate::config::ControllerConfig;
use crate::crd::AuthCluster;
use crate::error::ErrorKind;
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::gateway::{ChildKind, KubePlatformClient, PlatformClient};
use crate::retry::{exponential_delay, RetryConfig};
use crate::status::{self, count_ready, StatusReporter};
use crate::{Error, FIELD_MANAGER};

/// What the scheduler should do after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing to do until the cluster changes
    Done,
    /// Run again after the delay
    RequeueAfter(Duration),
    /// Run again right away; the next step is already known
    RequeueNow,
}

impl ReconcileOutcome {
    /// Translate into a controller-runtime action
    pub fn into_action(self) -> Action {
        match self {
            Self::Done => Action::await_change(),
            Self::RequeueAfter(delay) => Action::requeue(delay),
            Self::RequeueNow => Action::requeue(Duration::ZERO),
        }
    }
}

/// Controller context shared by every reconcile
///
/// Use [`Context::builder`] in production:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(config)
///     .registry(registry)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes API access (trait object for testability)
    pub client: Arc<dyn PlatformClient>,
    /// Event publisher for `kubectl describe` visibility
    pub events: Arc<dyn EventPublisher>,
    /// Operator configuration
    pub config: ControllerConfig,
    /// Child kinds whose changes wake a reconcile
    pub registry: Arc<ChildKindRegistry>,
    /// Retry policy for status writes that hit conflicts
    pub status_retry: RetryConfig,
    failures: DashMap<String, u32>,
    waits: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing without a Kubernetes client
    #[cfg(test)]
    pub fn for_testing(client: Arc<dyn PlatformClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self::from_parts(
            client,
            events,
            ControllerConfig::default(),
            Arc::new(ChildKindRegistry::standard(25)),
            RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
        )
    }

    fn from_parts(
        client: Arc<dyn PlatformClient>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
        registry: Arc<ChildKindRegistry>,
        status_retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            events,
            config,
            registry,
            status_retry,
            failures: DashMap::new(),
            waits: DashMap::new(),
        }
    }

    /// Count a failed pass for `key` and return the consecutive total
    fn record_failure(&self, key: &str) -> u32 {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Count a pass spent waiting on readiness and return the consecutive total
    fn record_wait(&self, key: &str) -> u32 {
        let mut entry = self.waits.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn clear_wait(&self, key: &str) {
        self.waits.remove(key);
    }

    fn forget(&self, key: &str) {
        self.failures.remove(key);
        self.waits.remove(key);
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    platform: Option<Arc<dyn PlatformClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ControllerConfig,
    registry: Option<Arc<ChildKindRegistry>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            platform: None,
            events: None,
            config: ControllerConfig::default(),
            registry: None,
        }
    }

    /// Set the operator configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the child kind registry
    pub fn registry(mut self, registry: Arc<ChildKindRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the platform client (primarily for testing)
    pub fn platform_client(mut self, platform: Arc<dyn PlatformClient>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let platform = self.platform.unwrap_or_else(|| {
            Arc::new(KubePlatformClient::new(
                self.client.clone(),
                self.config.api_timeout,
            ))
        });
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, FIELD_MANAGER)));
        let status_retry = RetryConfig {
            max_attempts: self.config.status_retry_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ChildKindRegistry::new()));

        Context::from_parts(platform, events, self.config, registry, status_retry)
    }
}

fn cache_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Reconcile an AuthCluster resource
///
/// The object handed in by the watcher only identifies the cluster; the
/// latest version is always re-read before acting.
#[instrument(
    skip(cluster, ctx),
    fields(cluster = %cluster.name_any(), namespace = %cluster.namespace().unwrap_or_default())
)]
pub async fn reconcile(cluster: Arc<AuthCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::missing_field("metadata.namespace"))?;
    let name = cluster.name_any();

    let outcome = reconcile_cluster(&namespace, &name, &ctx).await?;
    ctx.failures.remove(&cache_key(&namespace, &name));
    debug!(?outcome, "reconcile pass finished");
    Ok(outcome.into_action())
}

async fn reconcile_cluster(
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<ReconcileOutcome, Error> {
    let key = cache_key(namespace, name);

    let Some(cluster) = ctx.client.get_cluster(namespace, name).await? else {
        debug!("cluster no longer exists");
        ctx.forget(&key);
        return Ok(ReconcileOutcome::Done);
    };
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("cluster is being deleted, children are garbage collected");
        ctx.forget(&key);
        return Ok(ReconcileOutcome::Done);
    }

    if let Err(e) = cluster.validate() {
        return degrade(&cluster, ctx, &e).await;
    }

    let desired = StateCompiler::new(&ctx.config).compile(&cluster)?;
    let observed = ctx.client.list_children(namespace, name).await?;
    let plan = plan(&desired, &observed);
    debug!(
        desired = desired.resource_count(),
        observed = observed.len(),
        steps = plan.steps.len(),
        "computed plan"
    );

    let applied = apply_plan(&cluster, ctx, &plan).await?;
    debug!(writes = applied.writes, "applied plan");
    if applied.interrupted {
        info!("adopted an existing peer list, re-planning against its contents");
        return Ok(ReconcileOutcome::RequeueNow);
    }

    let mut replicas = observed.replicas;
    for ordinal in plan.removed_replicas() {
        replicas.remove(&ordinal);
    }
    let ready = count_ready(&replicas, desired.replicas_wanted);
    let reporter = StatusReporter::new(ctx.client.as_ref(), &ctx.status_retry);

    if plan.is_empty() && u32::try_from(ready).ok() == Some(desired.replicas_wanted) {
        let written = reporter
            .publish_best_effort(&cluster, &status::converged(&cluster, ready))
            .await;
        if written {
            info!(ready, "cluster converged");
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Normal,
                    reasons::CLUSTER_CONVERGED,
                    actions::RECONCILE,
                    Some(format!("{} nodes ready", ready)),
                )
                .await;
        }
        ctx.clear_wait(&key);
        return Ok(ReconcileOutcome::RequeueAfter(ctx.config.resync_interval));
    }

    let mut message = format!("{}/{} nodes ready", ready, desired.replicas_wanted);
    if let Some(reason) = plan.waiting.first() {
        message = format!("{}; {}", message, reason);
    }
    reporter
        .publish_best_effort(&cluster, &status::converging(&cluster, ready, message))
        .await;

    if plan.follow_up {
        return Ok(ReconcileOutcome::RequeueNow);
    }
    Ok(ReconcileOutcome::RequeueAfter(readiness_delay(ctx, &key)))
}

/// Delay before re-checking replicas that are not ready yet.
///
/// When Pod changes are watched the delay only bounds how long a missed event
/// can stall progress, so it backs off; otherwise it is the polling interval.
fn readiness_delay(ctx: &Context, key: &str) -> Duration {
    if !ctx.registry.is_watched(ChildKind::Replica) {
        return ctx.config.readiness_backoff_initial;
    }
    let attempt = ctx.record_wait(key);
    exponential_delay(
        ctx.config.readiness_backoff_initial,
        ctx.config.readiness_backoff_max,
        attempt,
    )
}

/// Record an invalid spec. Writes nothing if this generation was already
/// reported as Degraded.
async fn degrade(
    cluster: &AuthCluster,
    ctx: &Context,
    error: &Error,
) -> Result<ReconcileOutcome, Error> {
    if cluster.is_degraded_at_current_generation() {
        debug!(error = %error, "spec still invalid at this generation");
        return Ok(ReconcileOutcome::Done);
    }

    warn!(error = %error, "cluster spec is invalid");
    StatusReporter::new(ctx.client.as_ref(), &ctx.status_retry)
        .publish(cluster, &status::degraded(cluster, error))
        .await?;
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::RECONCILE,
            Some(error.to_string()),
        )
        .await;
    Ok(ReconcileOutcome::Done)
}

/// What executing a plan did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Applied {
    /// Writes that changed something
    writes: usize,
    /// Remaining steps were skipped because the plan was built on a wrong
    /// picture of the peer list
    interrupted: bool,
}

/// Execute the plan in order, stopping at the first hard failure.
///
/// NotFound on delete means another writer got there first. AlreadyExists on
/// create means an object with the child's name exists without the labels
/// the listing selects on; it is adopted so the next listing sees it. An
/// adopted peer list may hold stale addresses, so the remaining steps (which
/// may create replicas reading it) are skipped and the pass re-plans.
async fn apply_plan(cluster: &AuthCluster, ctx: &Context, plan: &Plan) -> Result<Applied, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let object_ref = cluster.object_ref(&());
    let mut outcome = Applied::default();

    for step in &plan.steps {
        let (applied, reason, action) = match step {
            Step::Create(child) => match ctx.client.create(child).await {
                Ok(()) => (true, reasons::CHILD_CREATED, actions::CREATE),
                Err(e) if e.is_already_exists() => {
                    debug!(
                        kind = %child.kind(),
                        name = child.name(),
                        "child already exists, adopting"
                    );
                    ctx.client.adopt(child).await?;
                    outcome.interrupted = child.kind() == ChildKind::PeerList;
                    (true, reasons::CHILD_ADOPTED, actions::ADOPT)
                }
                Err(e) => return Err(e),
            },
            Step::Patch(child) => {
                ctx.client.patch(child).await?;
                (true, reasons::CHILD_PATCHED, actions::PATCH)
            }
            Step::Delete {
                kind,
                name,
                ordinal,
            } => match ctx.client.delete(*kind, &namespace, name).await {
                Ok(()) => {
                    debug!(kind = %kind, ordinal = ?ordinal, "deleted child");
                    (true, reasons::CHILD_DELETED, actions::DELETE)
                }
                Err(e) if e.is_not_found() => (false, reasons::CHILD_DELETED, actions::DELETE),
                Err(e) => return Err(e),
            },
        };

        if applied {
            outcome.writes += 1;
            info!(kind = %step.kind(), name = step.name(), action, "applied change");
            ctx.events
                .publish(
                    &object_ref,
                    EventType::Normal,
                    reason,
                    action,
                    Some(format!("{} {}", step.kind(), step.name())),
                )
                .await;
        }
        if outcome.interrupted {
            break;
        }
    }

    Ok(outcome)
}

/// Decide when to retry after a failed pass
///
/// Conflicts retry immediately against a fresh read; everything else backs off
/// exponentially per cluster until a pass succeeds.
pub fn error_policy(cluster: Arc<AuthCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = cache_key(&cluster.namespace().unwrap_or_default(), &cluster.name_any());

    match error.kind() {
        ErrorKind::Conflict => {
            warn!(cluster = %key, error = %error, "write conflicted, retrying with a fresh read");
            Action::requeue(Duration::ZERO)
        }
        ErrorKind::Validation => {
            error!(cluster = %key, error = %error, "reconciliation rejected the spec");
            Action::await_change()
        }
        _ => {
            let attempt = ctx.record_failure(&key);
            let delay = exponential_delay(
                ctx.config.error_backoff_initial,
                ctx.config.error_backoff_max,
                attempt,
            );
            error!(
                cluster = %key,
                error = %error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconciliation failed"
            );
            Action::requeue(delay)
        }
    }
}
