//! Escrow Bridge Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (data under the platform data dir)
//! escrow-bridge
//!
//! # Custom config and Lotus endpoint
//! escrow-bridge --config /etc/escrow-bridge.toml --lotus-url http://lotus:1234/rpc/v0
//!
//! # Verbose logging
//! RUST_LOG=escrow_bridge=debug escrow-bridge
//! ```
//!
//! Sending SIGHUP re-reads the config file. Thresholds, status lists and the
//! expiry window take effect on the next job run; schedule cadences and the
//! HTTP port need a restart.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use escrow_bridge::config::{Config, ConfigHandle};
use escrow_bridge::db::{self, JobLocks};
use escrow_bridge::scheduler::{
    self, JobName, ReconcileJob, Scheduler, SweepExpiredJob, UnlockPaymentJob, UpdatePayStatusJob,
};
use escrow_bridge::{
    HttpServer, LoggingRefundBroadcaster, LotusChainObserver, RefundBroadcaster, Services,
};

#[derive(Parser, Debug)]
#[command(name = "escrow-bridge")]
#[command(about = "Storage deal reconciliation and escrow release daemon")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ESCROW_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (database and default config)
    #[arg(long, env = "ESCROW_BRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Lotus JSON-RPC endpoint
    #[arg(long, env = "LOTUS_API_URL")]
    lotus_url: Option<String>,

    /// Lotus API token
    #[arg(long, env = "LOTUS_API_TOKEN", hide_env_values = true)]
    lotus_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("escrow_bridge=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(url) = args.lotus_url {
        config.lotus.api_url = url;
    }
    if let Some(token) = args.lotus_token {
        config.lotus.access_token = token;
    }
    config.validate()?;

    info!(
        data_dir = %config.data_dir.display(),
        http_port = config.http_port,
        lotus = %config.lotus.api_url,
        threshold = config.attestation.threshold,
        "Starting escrow-bridge"
    );

    std::fs::create_dir_all(&config.data_dir)?;

    let config_path = args.config.clone().unwrap_or_else(|| config.config_path());
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let pool = db::open(&config.database_path(), config.pool_size)?;
    let stats = db::stats(&pool)?;
    info!(
        deals = stats.deals,
        open_deals = stats.open_deals,
        releases = stats.releases,
        "Database ready"
    );

    let schedule = config.schedule.clone();
    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let observer = Arc::new(LotusChainObserver::new(&config.lotus)?);
    let handle = ConfigHandle::new(config);
    let services = Services::new(pool.clone(), observer, handle.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Scheduler
    let holder = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
    let lease = chrono::Duration::seconds(schedule.lock_lease_secs as i64);
    let locks = JobLocks::new(pool.clone(), holder, lease);
    let broadcaster: Arc<dyn RefundBroadcaster> = Arc::new(LoggingRefundBroadcaster);

    let mut scheduler = Scheduler::new(locks, shutdown_rx.clone());
    scheduler
        .register(
            JobName::ScanDealStatus,
            Arc::new(ReconcileJob(Arc::clone(&services.reconciler))),
        )
        .register(
            JobName::UnlockPayment,
            Arc::new(UnlockPaymentJob(services.release.clone())),
        )
        .register(
            JobName::UpdatePayStatus,
            Arc::new(UpdatePayStatusJob {
                engine: services.release.clone(),
                broadcaster,
            }),
        )
        .register(
            JobName::SweepExpiredDeals,
            Arc::new(SweepExpiredJob(Arc::clone(&services.sweeper))),
        );

    let (trigger_tx, trigger_rx) = mpsc::channel(16);
    let triggers = scheduler::spawn_interval_triggers(&schedule, trigger_tx, shutdown_rx.clone());
    let scheduler_handle = tokio::spawn(scheduler.run(trigger_rx));

    #[cfg(unix)]
    spawn_reload_on_hangup(handle.clone(), config_path.clone(), shutdown_rx.clone())?;

    // HTTP API
    let http_server = Arc::new(HttpServer::new(services, pool.clone(), http_addr));
    info!("HTTP API available at http://{}", http_addr);

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run(shutdown_rx.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    // In-flight job items finish; no new items start
    let _ = shutdown_tx.send(true);
    for trigger in triggers {
        let _ = trigger.await;
    }
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }

    if let Ok(stats) = db::stats(&pool) {
        info!(
            deals = stats.deals,
            escrows = stats.escrows,
            releases = stats.releases,
            "Final stats"
        );
    }

    Ok(())
}

#[cfg(unix)]
fn spawn_reload_on_hangup(
    handle: ConfigHandle,
    path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match handle.reload(&path) {
                        Ok(()) => info!(path = %path.display(), "Config reloaded"),
                        Err(e) => warn!(error = %e, "Config reload failed, keeping previous"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
    Ok(())
}
