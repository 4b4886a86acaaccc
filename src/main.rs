//! cloudmetrics-adapter - serves Kubernetes custom and external metrics from Azure

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cloudmetrics_adapter::crds;
use cloudmetrics_adapter::lookup::KubeTargetLookup;
use cloudmetrics_adapter::server::{self, AppState, ServeConfig};
use cloudmetrics_cache::MetricCache;
use cloudmetrics_common::telemetry::{init_telemetry, TelemetryConfig};
use cloudmetrics_controller::{
    list_with_backoff, DeclarationStore, KubeDeclarationStore, ListBackoff, Reconciler,
};
use cloudmetrics_provider::{
    discover_subscription_id, AzureConfig, AzureFetcher, MetricsProvider, QueryResolver,
};

/// Kubernetes custom and external metrics adapter backed by Azure monitoring services
#[derive(Parser, Debug)]
#[command(name = "cloudmetrics-adapter", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Install or update the CRDs on startup
    #[arg(long)]
    install_crds: bool,

    /// Address the metrics API listens on
    #[arg(long, default_value = "0.0.0.0:6443")]
    bind_address: SocketAddr,

    /// PEM certificate for the metrics API
    #[arg(long, requires = "tls_key_file")]
    tls_cert_file: Option<PathBuf>,

    /// PEM private key for the metrics API
    #[arg(long, requires = "tls_cert_file")]
    tls_key_file: Option<PathBuf>,

    /// Subscription used by declarations without subscriptionID
    ///
    /// Discovered from the instance metadata service when unset.
    #[arg(long, env = "SUBSCRIPTION_ID")]
    default_subscription_id: Option<String>,

    /// Bearer token for Azure Resource Manager
    #[arg(long, env = "AZURE_ACCESS_TOKEN", hide_env_values = true)]
    azure_access_token: Option<String>,

    /// Application Insights API key
    #[arg(long, env = "APP_INSIGHTS_KEY", hide_env_values = true)]
    app_insights_key: Option<String>,

    /// Timeout for each Azure request, in seconds
    #[arg(long, default_value_t = 10)]
    fetch_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds::crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if cli.install_crds {
        crds::install_crds(&client).await?;
    }

    let timeout = Duration::from_secs(cli.fetch_timeout_secs);
    let default_subscription_id = match cli.default_subscription_id.filter(|s| !s.is_empty()) {
        Some(id) => id,
        None => discover_subscription_id(timeout).await.unwrap_or_else(|e| {
            warn!(error = %e, "No default subscription; declarations must set subscriptionID");
            String::new()
        }),
    };

    let fetcher = AzureFetcher::new(AzureConfig {
        default_subscription_id,
        access_token: cli.azure_access_token,
        app_insights_key: cli.app_insights_key,
        timeout,
        ..Default::default()
    })?;

    let cache = Arc::new(MetricCache::new());
    let provider = MetricsProvider::new(QueryResolver::new(Arc::clone(&cache)), Arc::new(fetcher));
    let lookup = KubeTargetLookup::new(client.clone()).await?;
    let ready = Arc::new(AtomicBool::new(false));
    let app = server::router(AppState {
        provider,
        lookup: Arc::new(lookup),
        ready: Arc::clone(&ready),
    });

    let cancel = CancellationToken::new();
    let serve_config = ServeConfig {
        addr: cli.bind_address,
        tls: cli.tls_cert_file.zip(cli.tls_key_file),
    };
    let mut server = tokio::spawn(server::serve(serve_config, app, cancel.clone()));

    let store = KubeDeclarationStore::new(client);
    let mut reconciler = Reconciler::new(cache);
    reconciler.initial_sync(list_with_backoff(&store, &ListBackoff::default()).await?);
    ready.store(true, Ordering::Release);
    info!("Initial declaration sync complete");

    let reconciler_task = tokio::spawn(reconciler.run(store.watch(), cancel.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
        result = &mut server => {
            cancel.cancel();
            let _ = reconciler_task.await;
            return match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("metrics API server exited unexpectedly")),
                Ok(Err(e)) => Err(anyhow::anyhow!("metrics API server failed: {}", e)),
                Err(e) => Err(anyhow::anyhow!("metrics API server task panicked: {}", e)),
            };
        }
    }

    cancel.cancel();
    if let Err(e) = reconciler_task.await {
        error!(error = %e, "Reconciler task failed");
    }
    server.await??;
    info!("Shutdown complete");
    Ok(())
}
