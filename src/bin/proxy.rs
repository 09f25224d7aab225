//! Per-canary proxy agent.
//!
//! Runs inside each proxy pod next to the nginx binary, reconciling the one
//! CanaryRelease it was launched for.

use clap::Parser;
use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use peippo::agent::{error_policy, reconcile, wait_for_cleanup, AgentContext};
use peippo::crd::{CanaryRelease, Release};
use peippo::nginx::NginxController;
use peippo::render::TeraRenderer;
use peippo::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Port for health endpoints; :80 belongs to nginx.
const HEALTH_PORT: u16 = 10254;

/// Per-canary traffic-splitting proxy agent
#[derive(Parser)]
#[command(name = "peippo-proxy", version, about)]
struct Options {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Name of the canary release this agent serves
    #[arg(long, env = "CANARY_RELEASE_NAME")]
    canary_release_name: String,

    /// Namespace of the canary release
    #[arg(long, env = "CANARY_RELEASE_NAMESPACE")]
    canary_release_namespace: String,

    /// Name of the release being canaried
    #[arg(long, env = "RELEASE_NAME")]
    release_name: String,

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

    info!(
        canary = %opts.canary_release_name,
        namespace = %opts.canary_release_namespace,
        release = %opts.release_name,
        "starting peippo proxy agent"
    );

    let metrics = create_metrics()?;
    let readiness = ReadinessState::new();

    // one shutdown channel fans out to the health server (drain + readiness)
    // and the nginx supervisor (stop respawning)
    let (shutdown_controller, shutdown_signal) = shutdown_channel();

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

    // the template watcher must outlive the controller for hot reload
    let (nginx, _template_watcher) = match NginxController::new() {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to load nginx template");
            shutdown_controller.shutdown();
            let _ = health_handle.await;
            return Err(e.into());
        }
    };
    let supervisor = nginx.spawn_supervisor(shutdown_signal.clone());

    let ctx = Arc::new(AgentContext::new(
        client.clone(),
        Arc::new(TeraRenderer),
        nginx.clone(),
        metrics,
        opts.canary_release_namespace.clone(),
        opts.canary_release_name.clone(),
        opts.release_name.clone(),
    ));

    let canaries: Api<CanaryRelease> =
        Api::namespaced(client.clone(), &opts.canary_release_namespace);
    let releases: Api<Release> = Api::namespaced(client.clone(), &opts.canary_release_namespace);

    let canary_wc = watcher::Config::default()
        .fields(&format!("metadata.name={}", opts.canary_release_name));
    let release_wc =
        watcher::Config::default().fields(&format!("metadata.name={}", opts.release_name));

    // release events re-enqueue our single canary
    let mapper_name = opts.canary_release_name.clone();
    let mapper_namespace = opts.canary_release_namespace.clone();
    let mapper_release = opts.release_name.clone();

    readiness.set_ready();
    info!("agent ready, starting reconciliation loop");

    let controller = Controller::new(canaries, canary_wc)
        .watches(releases, release_wc, move |release: Release| {
            (release.name_any() == mapper_release)
                .then(|| ObjectRef::new(&mapper_name).within(&mapper_namespace))
        })
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("reconciled: {:?}", o);
            }
        });
    let mut controller = std::pin::pin!(controller);

    tokio::select! {
        _ = &mut controller => {
            info!("agent stream ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "initiating graceful shutdown");
            // readiness flips and the supervisor stops respawning; nginx
            // itself keeps serving while cleanup runs
            shutdown_controller.shutdown();
            // keep reconciling while an in-flight transition gets time to
            // restore services; only then tear the watches down
            tokio::select! {
                _ = &mut controller => {}
                _ = wait_for_cleanup(&ctx) => {}
            }
        }
    }

    shutdown_controller.shutdown();
    let _ = supervisor.await;
    let _ = health_handle.await;

    let mut exit_code = 0;
    if let Err(e) = nginx.stop().await {
        error!(error = %e, "error stopping nginx");
        exit_code = 1;
    }

    info!(exit_code, "peippo proxy agent exiting");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
