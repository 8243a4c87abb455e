//! Infermesh server binary.
//!
//! Loads the YAML config, installs tracing and the Prometheus exporter,
//! wires the node, and serves until SIGINT/SIGTERM. Any startup failure
//! exits non-zero.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use infermesh_server::runtime::ServerRuntime;
use infermesh_server::transport::{EchoRuntime, InMemoryKvLog, LocalTransportHub};
use infermesh_server::Config;

#[derive(Debug, Parser)]
#[command(name = "infermesh-server", version, about = "Distributed LLM inference node")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "INFERMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the node id from the config.
    #[arg(long, env = "INFERMESH_NODE_ID")]
    node_id: Option<String>,

    /// Prometheus exporter listen address.
    #[arg(long, env = "INFERMESH_METRICS_ADDR", default_value = "127.0.0.1:9464")]
    metrics_addr: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,infermesh_server=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(node_id) = args.node_id {
        config.node.id = node_id;
    }
    if config.node.id.is_empty() {
        config.node.id = format!("node-{}", uuid::Uuid::new_v4());
    }

    let metrics_addr: std::net::SocketAddr = args
        .metrics_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics address {}: {e}", args.metrics_addr))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| anyhow::anyhow!("install prometheus exporter: {e}"))?;

    // The P2P transport and consensus log are deployment collaborators;
    // a standalone node runs on the in-process implementations.
    let hub = Arc::new(LocalTransportHub::new());
    let node_id = config.node.id.clone();
    let address = config.node.address.clone();
    let kv = Arc::new(InMemoryKvLog::new());
    let inference = Arc::new(EchoRuntime::new(&node_id));

    let runtime = ServerRuntime::build(
        config,
        move |router| Arc::new(hub.attach(&node_id, &address, router)),
        kv,
        inference,
    );

    // SIGINT/SIGTERM start the drain ceremony.
    let shutdown = runtime.shutdown_controller();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        shutdown.trigger_shutdown();
    });

    runtime.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("startup failed: {e}");
        std::process::exit(1);
    }
}
