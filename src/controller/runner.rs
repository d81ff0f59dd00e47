//! Controller runner - builds the AuthCluster controller future
//!
//! Construction is pure: nothing runs until the returned future is polled.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use super::cluster::{error_policy, reconcile, Context};
use crate::crd::AuthCluster;
use crate::gateway::ChildKind;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
///
/// The API server closes idle watches before the client gives up on them,
/// which avoids "body read timed out" errors.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future, ready to be awaited or joined with others
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the AuthCluster controller
///
/// Every kind in the context's registry becomes an owned-kind watch, so a
/// change to any child wakes its owning cluster. `namespace` restricts both
/// the cluster and child watches; `None` watches all namespaces.
pub fn build_controller(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) -> ControllerFuture {
    let clusters: Api<AuthCluster> = scoped_api(&client, namespace);
    let mut controller = Controller::new(
        clusters,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    );

    for entry in ctx.registry.entries() {
        let watcher = entry.watcher.clone();
        tracing::info!(kind = %entry.kind, "- watching owned kind");
        controller = match entry.kind {
            ChildKind::Service => controller.owns(scoped_api::<Service>(&client, namespace), watcher),
            ChildKind::PeerList => {
                controller.owns(scoped_api::<ConfigMap>(&client, namespace), watcher)
            }
            ChildKind::Claim => controller.owns(
                scoped_api::<PersistentVolumeClaim>(&client, namespace),
                watcher,
            ),
            ChildKind::Replica => controller.owns(scoped_api::<Pod>(&client, namespace), watcher),
        };
    }

    let concurrency = ctx.config.concurrency;
    tracing::info!(
        namespace = namespace.unwrap_or("*"),
        concurrency,
        "- AuthCluster controller"
    );

    Box::pin(
        controller
            .with_config(ControllerRuntimeConfig::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("AuthCluster")),
    )
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
