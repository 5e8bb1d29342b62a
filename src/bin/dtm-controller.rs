//! # DTM Controller
//!
//! Runs the reconciliation controller until Ctrl+C or SIGTERM.
//!
//! ## Usage
//!
//! ```bash
//! dtm-controller --etcd-url http://etcd:2379 --prometheus-url http://prometheus:9090
//!
//! # With a configuration file and JSON logs
//! DTM_LOG_FORMAT=json dtm-controller --config /etc/dtm/controller.toml
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dtm_controller::logging;
use dtm_controller::{Controller, ControllerConfig};

#[derive(Parser, Debug)]
#[command(name = "dtm-controller")]
#[command(about = "Entanglement-aware reconciliation controller for digital twins")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "DTM_CONFIG")]
    config: Option<PathBuf>,

    /// Prometheus base URL
    #[arg(long, env = "DTM_PROMETHEUS_URL")]
    prometheus_url: Option<String>,

    /// Telemetry polling interval in seconds
    #[arg(long, env = "DTM_PROMETHEUS_INTERVAL")]
    prometheus_interval: Option<u64>,

    /// etcd endpoint
    #[arg(long, env = "DTM_ETCD_URL")]
    etcd_url: Option<String>,

    /// Path to a kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace holding the managed objects
    #[arg(long, env = "DTM_NAMESPACE")]
    namespace: Option<String>,
}

impl Args {
    fn apply(self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(url) = self.prometheus_url {
            config = config.with_telemetry_url(url);
        }
        if let Some(interval) = self.prometheus_interval {
            config = config.with_poll_interval_seconds(interval);
        }
        if let Some(url) = self.etcd_url {
            config = config.with_store_endpoint(url);
        }
        if let Some(path) = self.kubeconfig {
            config = config.with_kubeconfig(path);
        }
        if let Some(namespace) = self.namespace {
            config = config.with_namespace(namespace);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let args = Args::parse();

    info!("Starting DTM controller");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ControllerConfig::load(args.config.as_deref())
        .context("failed to load controller configuration")?;
    let config = args.apply(config);
    config
        .validate()
        .context("invalid controller configuration")?;

    info!("   Store: {:?}", config.store.endpoints);
    info!("   Telemetry: {} every {}s", config.telemetry.url, config.telemetry.poll_interval_seconds);
    info!("   Namespace: {}", config.cluster.namespace);

    let controller = Controller::new(config)
        .await
        .context("failed to connect controller backends")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping controller");
            cancel.cancel();
        }
    });

    let stats = controller.run(cancel).await.context("controller stopped with an error")?;

    info!(
        processed = stats.processed.load(Ordering::Relaxed),
        failed = stats.failed.load(Ordering::Relaxed),
        "DTM controller shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
