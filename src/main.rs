//! viplb - a TCP load balancer with virtual IP management
//!
//! Usage:
//!     viplb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use tokio::sync::broadcast;
use viplb::config::{ConfigStorage, FileStorage};
use viplb::reconciler::Reconciler;
use viplb::util::{init_logging, LogFormat};

/// A TCP load balancer with virtual IP pool management.
#[derive(Parser, Debug)]
#[command(name = "viplb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// How often configuration is reconciled against running instances
    #[arg(
        long,
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        default_value = "10s"
    )]
    reconcile_interval: Duration,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format);

    let storage = Arc::new(FileStorage::new(&cli.config));
    let config = storage.get_config().with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    if cli.validate {
        println!("Configuration is valid.");
        println!(
            "  Pool: {} on {}",
            config.ip_pool.network, config.ip_pool.device
        );
        println!("  Services: {}", config.services.len());
        for service in &config.services {
            let addr = service
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "(from pool)".to_string());
            println!(
                "    - {} @ {} ({} ports, {} backends)",
                service.name,
                addr,
                service.ports.len(),
                service.backends.len()
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        pool = %config.ip_pool.network,
        device = %config.ip_pool.device,
        services = config.services.len(),
        "viplb starting"
    );

    for service in &config.services {
        info!(
            name = %service.name,
            ports = service.ports.len(),
            backends = service.backends.len(),
            "configured service"
        );
    }

    run(storage, cli.reconcile_interval)
}

/// Run the load balancer until a shutdown signal arrives.
fn run(storage: Arc<FileStorage>, interval: Duration) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(storage, interval))
}

async fn run_async(storage: Arc<FileStorage>, interval: Duration) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let reconciler =
        Reconciler::new(storage, interval).context("failed to initialize reconciler")?;
    let handle = tokio::spawn(reconciler.run(shutdown_tx.subscribe()));

    info!("viplb is running");

    wait_for_signal().await;
    info!("received shutdown signal");

    // The reconciler stops every instance before its task finishes
    let _ = shutdown_tx.send(());
    let _ = handle.await;

    info!("viplb shut down complete");
    Ok(())
}

/// Wait for an interrupt or terminate signal.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for interrupt signal");
                }
                return;
            }
        };

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error = %e, "failed to listen for interrupt signal");
                }
            }
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }
}
