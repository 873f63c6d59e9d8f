use anyhow::{Context, Result};
use clap::Parser;
use cockpit_daemon::{CockpitConfig, DEFAULT_CONFIG_FILE, ServiceOrchestrator};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

/// Cockpit daemon - GPU inference service orchestrator
#[derive(Parser)]
#[command(name = "cockpit-daemon", about = "Supervise GPU inference services")]
struct Args {
    /// Service configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Start every service in dependency order once the daemon is up
    #[arg(long)]
    autostart: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = CockpitConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if args.check {
        println!(
            "{}: {} services, {} models",
            args.config.display(),
            config.services.len(),
            config.models.variants.len()
        );
        return Ok(());
    }

    info!("Starting cockpit daemon with {}", args.config.display());

    let orchestrator = ServiceOrchestrator::new(config)?;
    orchestrator.recover().await?;

    if let Some(model) = orchestrator.current_model() {
        info!("Active model: {}", model);
    }
    info!("Start order: {:?}", orchestrator.graph().start_order());

    let gpu = orchestrator.gpu_info().await;
    match (&gpu.name, gpu.memory_used_mb, gpu.memory_total_mb) {
        (Some(name), Some(used), Some(total)) => info!("GPU: {} ({} / {} MiB in use)", name, used, total),
        (Some(name), _, _) => info!("GPU: {}", name),
        _ => warn!("No GPU metrics available"),
    }

    if args.autostart
        && let Err(e) = orchestrator.start_all().await
    {
        error!("Autostart incomplete: {}", e);
    }

    for snapshot in orchestrator.status() {
        info!("{} ({}): {}", snapshot.name, snapshot.id, snapshot.state);
    }

    shutdown_signal().await;

    if let Err(e) = orchestrator.stop_all().await {
        warn!("Some services could not be stopped: {}", e);
    }
    info!("Cockpit daemon stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
