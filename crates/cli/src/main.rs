use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use kube::CustomResourceExt;
use rudder_api::ServingStack;
use rudder_apply::Manifest;
use rudder_kubehub::KubeHub;
use rudder_reconcile::{Platforms, Reconciler, ReconcilerConfig};
use tracing::info;

mod controller;

#[derive(Parser, Debug)]
#[command(name = "rudder-operator", version, about = "Installs the serving stack for each ServingStack resource")]
struct Cli {
    /// Directory holding the manifest templates
    #[arg(long = "manifest-dir", env = "RUDDER_MANIFEST_DIR")]
    manifest_dir: Option<PathBuf>,

    /// Descend into subdirectories of the manifest directory
    #[arg(long = "recursive", action = ArgAction::SetTrue)]
    recursive: bool,

    /// Only watch stacks in this namespace (default: all namespaces)
    #[arg(long = "namespace")]
    namespace: Option<String>,

    /// Seconds before a stack that is not ready yet is reconciled again
    #[arg(long = "requeue-secs", default_value_t = 30)]
    requeue_secs: u64,

    /// Print the ServingStack CRD as YAML and exit
    #[arg(long = "print-crd", action = ArgAction::SetTrue)]
    print_crd: bool,
}

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RUDDER_METRICS_ADDR; expected host:port");
        }
    }
}

/// `$KO_DATA_PATH/serving` when running from a ko-built image, `./config/serving` otherwise.
fn default_manifest_dir(ko_data_path: Option<String>) -> PathBuf {
    match ko_data_path {
        Some(base) if !base.is_empty() => PathBuf::from(base).join("serving"),
        _ => PathBuf::from("config").join("serving"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if cli.print_crd {
        print!("{}", serde_yaml::to_string(&ServingStack::crd())?);
        return Ok(());
    }

    let dir = cli
        .manifest_dir
        .clone()
        .unwrap_or_else(|| default_manifest_dir(std::env::var("KO_DATA_PATH").ok()));
    let manifest = Manifest::from_path(&dir, cli.recursive)
        .with_context(|| format!("loading manifest from {}", dir.display()))?;
    info!(dir = %dir.display(), resources = manifest.len(), "manifest loaded");

    let hub = KubeHub::try_default().await.context("connecting to the cluster")?;
    let client = hub.client();
    let config = ReconcilerConfig { requeue_after: Duration::from_secs(cli.requeue_secs), ..Default::default() };
    info!(version = %config.version, namespace = ?cli.namespace, "starting operator");
    let reconciler = Arc::new(Reconciler::new(Arc::new(hub), Arc::new(manifest), Platforms::common(), config));

    controller::run(client, cli.namespace.as_deref(), reconciler).await;
    info!("operator stopped");
    Ok(())
}
