use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use owo_colors::OwoColorize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod bus;
mod config;
mod context;
mod control;
mod events;
mod model;
mod monitors;
mod observer;
mod reconcile;
#[cfg(test)]
mod testutil;
mod util;

use context::ManagerContext;
use util::colors::FG1;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Kubernetes operator for QEMU-based VirtualMachine custom resources")]
struct Cli {
    /// Path to the reconciler's YAML config file (overrides VMOP_CONFIG).
    #[arg(long, env = "VMOP_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch (overrides VMOP_NAMESPACE and the in-cluster namespace file).
    #[arg(long, env = "VMOP_NAMESPACE")]
    namespace: Option<String>,

    /// Address the Prometheus metrics/health endpoints listen on.
    #[arg(long, env = "VMOP_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Disables the metrics HTTP server even when the `metrics` feature is compiled in.
    #[arg(long, env = "VMOP_DISABLE_METRICS")]
    disable_metrics: bool,
}

#[tokio::main]
async fn main() {
    util::colors::apply_disable_colors_env();

    let cli = Cli::parse();

    let config = match config::load(config::LoadOptions {
        config_file: cli.config.clone(),
        namespace: cli.namespace.clone(),
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {err}", "fatal startup error:".red());
            std::process::exit(1);
        }
    };

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("{} {err}", "failed to build Kubernetes client:".red());
            std::process::exit(1);
        }
    };

    println!(
        "{} namespace={}",
        "vmop-manager starting,".color(FG1),
        config.namespace
    );

    let cancel = CancellationToken::new();
    let ctx = ManagerContext::new(client.clone(), config.clone(), cancel.clone());

    let mut tasks = Vec::new();

    #[cfg(feature = "metrics")]
    if !cli.disable_metrics {
        let metrics = ctx.metrics.clone();
        let addr = cli.metrics_addr;
        tasks.push(tokio::spawn(async move {
            if let Err(err) = util::metrics::serve(metrics, addr).await {
                eprintln!("{} {err}", "metrics server error:".red());
            }
        }));
    }

    let (membership_tx, membership_rx) = mpsc::unbounded_channel();
    let pending_pod_changes = monitors::PendingBuffer::new();

    {
        let client = client.clone();
        let namespace = config.namespace.clone();
        let pools = ctx.pools.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            monitors::run_pool_monitor(client, namespace, pools, membership_rx, cancel).await;
        }));
    }

    {
        let client = client.clone();
        let namespace = config.namespace.clone();
        let channels = ctx.channels.clone();
        let pending_pod_changes = pending_pod_changes.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            monitors::run_pod_monitor(client, namespace, channels, pending_pod_changes, cancel).await;
        }));
    }

    {
        let client = client.clone();
        let namespace = config.namespace.clone();
        let channels = ctx.channels.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            monitors::run_secret_monitor(client, namespace, channels, cancel).await;
        }));
    }

    {
        let client = client.clone();
        let namespace = config.namespace.clone();
        let channels = ctx.channels.clone();
        let cancel = cancel.clone();
        let handler_ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            monitors::run_vm_monitor(
                client,
                namespace,
                channels,
                membership_tx,
                pending_pod_changes,
                cancel,
                move || reconcile::make_handler(handler_ctx.clone()),
            )
            .await;
        }));
    }

    util::shutdown::shutdown_signal().await;
    println!("{}", "shutting down, draining in-flight reconciles".color(FG1));
    cancel.cancel();

    for task in tasks {
        let _ = task.await;
    }
}
