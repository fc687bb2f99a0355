//! `nova-hub` entry point.
//!
//! ## Modes
//!
//! - **Service mode** (default): open the store, fail runs interrupted by a
//!   previous process, start the optional scheduler and serve the socket.
//! - **`--ping`**: handshake with a running service, print its status line
//!   and exit non-zero when it cannot be reached.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nova_hub_core::HubConfig;
use nova_hub_core::engine::Engine;
use nova_hub_core::engine::ProcessEngine;
use nova_hub_core::processing::run_scheduler;
use nova_hub_service::health;
use nova_hub_service::service::HubService;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "nova-hub", version, about = "Packet hub for inter-BBS door game leagues")]
struct Args {
    /// Path to config.toml. Defaults to the user config directory.
    #[arg(long, env = "NOVA_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Unix socket to listen on.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory holding the database and league work directories.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Report the status of the service answering on the socket, then exit.
    #[arg(long)]
    ping: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn ping(config: HubConfig) -> std::io::Result<()> {
    let report = health::check(&config.socket_path(), health::DEFAULT_PING_TIMEOUT)
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("ping: {e}")))?;
    println!("{}", report.summary());
    if report.is_degraded() {
        eprintln!("ping: open sequence alerts need attention");
    }
    Ok(())
}

fn load_config(args: &Args) -> std::io::Result<HubConfig> {
    let mut config = HubConfig::load(args.config.as_deref())
        .map_err(|e| std::io::Error::other(format!("failed to load config: {e}")))?;
    if let Some(socket) = &args.socket {
        config.server.socket_path = Some(socket.clone());
    }
    if let Some(data_dir) = &args.data_dir {
        config.server.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.ping {
        return ping(config);
    }

    run_service(config)
}

#[tokio::main]
async fn run_service(config: HubConfig) -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    tracing::info!("nova-hub v{} starting", env!("CARGO_PKG_VERSION"));

    let engine: Arc<dyn Engine> = Arc::new(ProcessEngine::from_config(&config.engine));
    let service = Arc::new(HubService::open(&config, engine).map_err(|e| {
        std::io::Error::other(format!("failed to open hub database: {e}"))
    })?);
    tracing::info!(
        "hub database at {}, {} league(s) configured",
        config.database_path().display(),
        config.leagues.len()
    );

    if let Err(err) = service.orchestrator().reconcile_stale_runs().await {
        tracing::warn!("could not reconcile interrupted runs: {err}");
    }

    let scheduler_shutdown = CancellationToken::new();
    if let Some(interval) = config.poll_interval() {
        tokio::spawn(run_scheduler(
            Arc::clone(service.orchestrator()),
            interval,
            scheduler_shutdown.clone(),
        ));
    }

    let listener = nova_hub_service::ipc::bind(&config.socket_path())?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let signal_service = Arc::clone(&service);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let active = signal_service.orchestrator().active_run();
        tracing::info!(active_run = ?active, "signal received, shutting down");
        scheduler_shutdown.cancel();
        if let Some(run_id) = active
            && let Err(err) = signal_service.orchestrator().cancel(&run_id).await
        {
            tracing::warn!("could not cancel run {run_id}: {err}");
        }
        let _ = shutdown_tx.send(true);
    });

    nova_hub_service::ipc::serve(Arc::clone(&service), listener, shutdown_rx).await?;

    // Let a cancelled run record its failure before the runtime stops.
    for _ in 0..50 {
        if service.orchestrator().active_run().is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    tracing::info!("nova-hub exiting cleanly");
    Ok(())
}
