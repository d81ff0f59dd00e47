//! Test helpers for integration tests
//!
//! Provides utilities for managing kind clusters and Kubernetes resources.

use std::future::Future;
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use authcluster::config::ControllerConfig;
use authcluster::controller::{build_controller, ChildKindRegistry, Context, WATCH_TIMEOUT_SECS};
use authcluster::crd::{AuthCluster, AuthClusterSpec};

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "authcluster-integration-test";

/// Image that listens on a TCP port without extra configuration, so the
/// replicas' readiness probe passes inside kind
pub const TEST_NODE_IMAGE: &str = "nginxinc/nginx-unprivileged:1.27-alpine";

/// Port [`TEST_NODE_IMAGE`] listens on
pub const TEST_NODE_PORT: u16 = 8080;

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRD has been installed (async-safe)
static CRD_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Install (or refresh) the AuthCluster CRD with server-side apply
pub async fn install_crd(client: &Client) -> Result<(), kube::Error> {
    let crd = AuthCluster::crd();
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let name = crd.metadata.name.clone().unwrap_or_default();

    println!("Installing AuthCluster CRD...");
    crds.patch(
        &name,
        &PatchParams::apply("authcluster-integration-test").force(),
        &Patch::Apply(&crd),
    )
    .await?;

    // Wait for CRD to be established
    sleep(Duration::from_secs(2)).await;

    println!("CRD installed successfully");
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (thread-safe, cluster created once)
///
/// Returns a fresh Client for each call - clients should not be shared across test threads.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    let crd_result = CRD_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crd(&client)
                .await
                .map_err(|e| format!("failed to install CRD: {e}"))
        })
        .await;
    crd_result.clone()?;

    Ok(client)
}

/// Recreate a namespace so each story starts from nothing
pub async fn fresh_namespace(client: &Client, name: &str) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let _ = namespaces.delete(name, &DeleteParams::default()).await;
    wait_for(&format!("namespace {name} to be gone"), Duration::from_secs(120), || {
        let namespaces = namespaces.clone();
        async move { matches!(namespaces.get_opt(name).await, Ok(None)) }
    })
    .await;

    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    namespaces
        .create(&PostParams::default(), &namespace)
        .await
        .expect("failed to create namespace");
}

/// Build an AuthCluster manifest
pub fn auth_cluster(name: &str, node_count: i32) -> AuthCluster {
    AuthCluster::new(
        name,
        AuthClusterSpec {
            node_count,
            store_url: "redis://redis:6379".to_string(),
        },
    )
}

/// Operator configuration whose replicas become ready inside kind
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        image: TEST_NODE_IMAGE.to_string(),
        node_port: TEST_NODE_PORT,
        readiness_backoff_max: Duration::from_secs(5),
        ..ControllerConfig::default()
    }
}

/// Run the controller in-process, scoped to `namespace`
pub fn spawn_controller(client: Client, namespace: &str) -> JoinHandle<()> {
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(test_config())
            .registry(Arc::new(ChildKindRegistry::standard(WATCH_TIMEOUT_SECS)))
            .build(),
    );
    let namespace = namespace.to_string();
    tokio::spawn(async move { build_controller(client, ctx, Some(&namespace)).await })
}

/// Poll `check` every second until it returns true, panicking after `timeout`
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out after {timeout:?} waiting for {what}");
        }
        sleep(Duration::from_secs(1)).await;
    }
}
