//! nettrap: low-interaction async honeypot.
//!
//! Loads config, wires the event logger, stands up one server per configured
//! service plus a reporter task, then waits for ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use nettrap::config::{Cli, Config};
use nettrap::logger::JsonLogger;
use nettrap::orchestrator::ServiceOrchestrator;
use nettrap::reporter::Reporter;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nettrap=info")),
    };
    fmt().with_env_filter(filter).init();

    let cfg = Config::from_cli(&cli).context("loading configuration")?;

    if cli.list_services {
        for (kind, service) in &cfg.services {
            println!("{} on port {}", kind.name(), service.port);
        }
        return Ok(());
    }

    info!(sensor = %cfg.sensor_id, services = cfg.services.len(), "starting nettrap");

    let logger = Arc::new(JsonLogger::new());
    let orchestrator = ServiceOrchestrator::new(&cfg, logger.clone());
    let started = orchestrator.start_all().await;
    if started == 0 {
        anyhow::bail!("no configured service could be started");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let reporter_task = if cfg.backend_url.is_some() {
        let mut reporter = Reporter::new(cfg.clone(), logger.buffer(), shutdown_rx);
        Some(tokio::spawn(async move { reporter.run().await }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    orchestrator.stop_all().await;
    let _ = shutdown_tx.send(());
    if let Some(task) = reporter_task {
        let _ = task.await;
    }
    Ok(())
}
