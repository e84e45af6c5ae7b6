use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use courier_core::Selector;
use courier_kubehub::{spawn_watchers, KubeProvider};
use courier_sink::{DispatchConfig, Dispatcher};
use courier_store::spawn_aggregator;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::{clamp_interval, Configuration, MIN_FLUSH, MIN_RESYNC};

#[derive(Parser, Debug)]
#[command(name = "courierd", version, about = "Forward Kubernetes resource changes to a system-of-record")]
struct Cli {
    /// Cluster name, prefixed to every external id
    #[arg(long, env = "COURIER_CLUSTER")]
    cluster: String,

    /// Integration alias/id, or a custom webhook URL
    #[arg(long, env = "COURIER_INTEGRATION")]
    integration: String,

    /// GraphQL endpoint of the system-of-record
    #[arg(long = "api-url", env = "COURIER_API_URL", default_value = "http://localhost:8080/graphql")]
    api_url: String,

    /// Bearer token for the GraphQL endpoint
    #[arg(long = "api-token", env = "COURIER_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// YAML file with a `selectors:` list (overrides the built-in sets)
    #[arg(long = "config", env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Watch the extended built-in selector set instead of Deployments only
    #[arg(long = "extended", action = ArgAction::SetTrue)]
    extended: bool,

    /// Log what would be sent instead of calling the sink
    #[arg(long = "dry-run", env = "COURIER_DRY_RUN", action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Full resync interval in seconds (minimum 3600)
    #[arg(long = "resync-secs", env = "COURIER_RESYNC_SECS", default_value_t = 86_400)]
    resync_secs: u64,

    /// Flush interval in seconds once the initial sync is over (minimum 10)
    #[arg(long = "flush-secs", env = "COURIER_FLUSH_SECS", default_value_t = 30)]
    flush_secs: u64,

    /// Capacity of the watcher -> aggregator queue
    #[arg(long = "queue-cap", env = "COURIER_QUEUE_CAP", default_value_t = 256)]
    queue_cap: usize,

    /// Timeout for each call to the sink, in seconds
    #[arg(long = "http-timeout-secs", default_value_t = 30)]
    http_timeout_secs: u64,

    /// Extra dotted payload path to strip before upserting (repeatable); managedFields is always stripped
    #[arg(long = "strip-field", action = ArgAction::Append)]
    strip_fields: Vec<String>,
}

fn init_tracing() {
    let env = std::env::var("COURIER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("COURIER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid COURIER_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_selectors(cli: &Cli) -> Result<Vec<Selector>> {
    let cfg = match &cli.config {
        Some(path) => Configuration::load(path)?,
        None if cli.extended => Configuration::extended_set()?,
        None => Configuration::default_set()?,
    };
    Ok(cfg.selectors)
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let sig = shutdown_signal().await;
        info!(signal = sig, "handling interruption");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    match unix_signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; only Ctrl-C will stop the agent");
            let _ = signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = signal::ctrl_c().await;
    "ctrl-c"
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let selectors = load_selectors(&cli)?;
    let resync = clamp_interval("resync", Duration::from_secs(cli.resync_secs), MIN_RESYNC);
    let flush = clamp_interval("flush", Duration::from_secs(cli.flush_secs), MIN_FLUSH);
    info!(
        cluster = %cli.cluster,
        selectors = selectors.len(),
        resync_secs = resync.as_secs(),
        flush_secs = flush.as_secs(),
        dry_run = cli.dry_run,
        "courierd starting"
    );

    let sink = courier_sink::sink_for(
        &cli.integration,
        &cli.api_url,
        cli.api_token.clone(),
        Duration::from_secs(cli.http_timeout_secs),
    )?;
    let dispatcher = Dispatcher::new(
        Arc::from(sink),
        DispatchConfig { cluster: cli.cluster.clone(), dry_run: cli.dry_run, strip_fields: cli.strip_fields.clone() },
    );
    let provider = Arc::new(KubeProvider::try_default().await.context("building kube client")?);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let (tx, rx) = mpsc::channel(cli.queue_cap.max(1));
    let aggregator = spawn_aggregator(dispatcher, flush, rx, cancel.clone())?;
    let watchers = spawn_watchers(provider, &selectors, resync, tx, &cancel).await;
    if watchers.is_empty() {
        cancel.cancel();
        join_logged("aggregator", vec![aggregator]).await;
        bail!("none of the {} configured selectors could be resolved", selectors.len());
    }

    // Returns after cancellation, once the final flush has been handed to the sink.
    aggregator.await.context("aggregator task failed")?;
    cancel.cancel();
    join_logged("watcher", watchers).await;
    info!("courierd stopped");
    Ok(())
}

/// Await every task, logging the ones that panicked or were aborted. Returns how many failed.
async fn join_logged(task: &str, handles: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for h in handles {
        if let Err(e) = h.await {
            error!(task, error = %e, "task ended abnormally");
            failed += 1;
        }
    }
    failed
}
