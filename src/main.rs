use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use peippo::controller::{canary_release_for_pod, ensure_crd};
use peippo::crd::{CanaryRelease, LABEL_CREATED_BY};
use peippo::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use peippo::{error_policy, reconcile, Context};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Default port for health endpoints
const HEALTH_PORT: u16 = 8080;

const DEFAULT_PROXY_IMAGE: &str = "ghcr.io/peippo/canary-proxy-nginx:v0.1.0";

/// Cluster-wide canary release controller
#[derive(Parser)]
#[command(name = "peippo", version, about)]
struct Options {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Image of the traffic-splitting proxy
    #[arg(long, env = "PROXY_IMAGE", default_value = DEFAULT_PROXY_IMAGE)]
    proxy_image: String,

    /// Run with debug logging
    #[arg(long)]
    debug: bool,

    /// Force colored log output
    #[arg(long)]
    log_force_color: bool,
}

fn init_tracing(opts: &Options) {
    let default_level = if opts.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_ansi(opts.log_force_color || std::io::stdout().is_terminal())
        .init();
}

/// Build a client from the given kubeconfig, or from the in-cluster /
/// default environment when no path is given.
async fn build_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    match kubeconfig {
        None => Ok(Client::try_default().await?),
        Some(path) => {
            info!(path = %path.display(), "loading kubeconfig");
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            let config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?;
            Ok(Client::try_from(config)?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    init_tracing(&opts);

    info!("starting peippo canary release controller");

    let metrics = create_metrics()?;
    let readiness = ReadinessState::new();

    // Shutdown fans out through one channel: the health server drains and
    // /readyz flips to not-ready the moment it triggers
    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    // Start health server in background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_shutdown = shutdown_signal.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) =
            run_health_server(HEALTH_PORT, health_readiness, health_metrics, health_shutdown).await
        {
            error!(error = %e, "health server failed");
        }
    });

    let client = match build_client(opts.kubeconfig.as_deref()).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to create Kubernetes client");
            shutdown_controller.shutdown();
            let _ = health_handle.await;
            return Err(e);
        }
    };
    info!("connected to Kubernetes cluster");

    // the CRD must exist before the watch below can start
    ensure_crd(&client).await?;

    let ctx = Arc::new(Context::new(
        client.clone(),
        opts.proxy_image.clone(),
        metrics,
    ));

    let canaries = Api::<CanaryRelease>::all(client.clone());
    let deployments = Api::<Deployment>::all(client.clone());
    let pods = Api::<Pod>::all(client.clone());
    let created_by = watcher::Config::default().labels(LABEL_CREATED_BY);

    readiness.set_ready();
    info!("controller ready, starting reconciliation loop");

    // proxy deployments are owned children; pods reverse-resolve through the
    // created-by label
    let controller = Controller::new(canaries, watcher::Config::default())
        .owns(deployments, created_by.clone())
        .watches(pods, created_by, |pod: Pod| canary_release_for_pod(&pod))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("reconciled: {:?}", o);
            }
            // errors are logged in error_policy, no duplicate logging
        });

    tokio::select! {
        _ = controller => {
            info!("controller stream ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "initiating graceful shutdown");
        }
    }

    // trigger shutdown for all components; readiness flips via the channel
    shutdown_controller.shutdown();
    let _ = health_handle.await;

    info!("peippo controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "main_test.rs"]
mod tests;
