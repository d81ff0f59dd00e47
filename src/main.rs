//! AuthCluster Operator - keeps auth-node clusters convergent with their spec

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use authcluster::config::ControllerConfig;
use authcluster::controller::{build_controller, ChildKindRegistry, Context, WATCH_TIMEOUT_SECS};
use authcluster::crd::AuthCluster;
use authcluster::{DEFAULT_CLUSTER_DOMAIN, DEFAULT_NODE_IMAGE, DEFAULT_NODE_PORT, DEFAULT_STORAGE_SIZE};

/// AuthCluster operator - CRD-driven lifecycle management for auth-node clusters
#[derive(Parser, Debug)]
#[command(name = "authcluster-operator", version, about, long_about = None)]
struct Cli {
    /// Print the AuthCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    ///
    /// Watches AuthCluster resources and the children they own, and keeps
    /// each cluster's Service, peer list, claims and replicas convergent.
    Controller,
}

/// Controller settings, accepted before or after the subcommand
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Only watch this namespace (default: all namespaces)
    #[arg(long, global = true, env = "AUTHCLUSTER_NAMESPACE")]
    namespace: Option<String>,

    /// Container image for auth nodes
    #[arg(long, global = true, env = "AUTHCLUSTER_IMAGE", default_value = DEFAULT_NODE_IMAGE)]
    image: String,

    /// Image pull policy for auth nodes
    #[arg(long, global = true, env = "AUTHCLUSTER_IMAGE_PULL_POLICY", default_value = "IfNotPresent")]
    image_pull_policy: String,

    /// Port every auth node listens on
    #[arg(long, global = true, env = "AUTHCLUSTER_NODE_PORT", default_value_t = DEFAULT_NODE_PORT)]
    node_port: u16,

    /// Capacity requested by each replica's claim
    #[arg(long, global = true, env = "AUTHCLUSTER_STORAGE_SIZE", default_value = DEFAULT_STORAGE_SIZE)]
    storage_size: String,

    /// StorageClass for replica claims (cluster default when unset)
    #[arg(long, global = true, env = "AUTHCLUSTER_STORAGE_CLASS")]
    storage_class: Option<String>,

    /// DNS suffix after the namespace in peer addresses
    #[arg(long, global = true, env = "AUTHCLUSTER_CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    cluster_domain: String,

    /// Deadline for each Kubernetes API call, in seconds
    #[arg(long, global = true, env = "AUTHCLUSTER_API_TIMEOUT_SECS", default_value_t = 10)]
    api_timeout_secs: u64,

    /// Resync interval for converged clusters, in seconds
    #[arg(long, global = true, env = "AUTHCLUSTER_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// First requeue delay while replicas become ready, in seconds
    #[arg(long, global = true, env = "AUTHCLUSTER_READINESS_BACKOFF_SECS", default_value_t = 2)]
    readiness_backoff_secs: u64,

    /// Upper bound for the readiness requeue delay, in seconds
    #[arg(long, global = true, env = "AUTHCLUSTER_READINESS_BACKOFF_MAX_SECS", default_value_t = 60)]
    readiness_backoff_max_secs: u64,

    /// Maximum number of clusters reconciled in parallel (0 = unbounded)
    #[arg(long, global = true, env = "AUTHCLUSTER_CONCURRENCY", default_value_t = 8)]
    concurrency: u16,
}

impl ControllerArgs {
    fn into_config(self) -> ControllerConfig {
        ControllerConfig {
            image: self.image,
            image_pull_policy: self.image_pull_policy,
            node_port: self.node_port,
            storage_size: self.storage_size,
            storage_class: self.storage_class,
            cluster_domain: self.cluster_domain,
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            readiness_backoff_initial: Duration::from_secs(self.readiness_backoff_secs),
            readiness_backoff_max: Duration::from_secs(self.readiness_backoff_max_secs),
            concurrency: self.concurrency,
            ..ControllerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs every TLS connection to the API server
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}. \
             The operator cannot talk to the API server without TLS.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&AuthCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Run the AuthCluster controller until SIGTERM/SIGINT
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let namespace = args.namespace.clone();
    let config = args.into_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let registry = Arc::new(ChildKindRegistry::standard(WATCH_TIMEOUT_SECS));
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .registry(registry)
            .build(),
    );

    tracing::info!("Starting AuthCluster controller...");
    build_controller(client, ctx, namespace.as_deref()).await;
    tracing::info!("AuthCluster controller shut down");

    Ok(())
}
