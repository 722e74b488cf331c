// Site watch scheduler binary entry point

use anyhow::{Context, Result};
use common::bootstrap::init_site_watch;
use common::config::Settings;
use common::notify::LogTransport;
use common::telemetry::{init_logging, init_metrics};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    init_logging(
        &settings.observability.log_level,
        &settings.observability.log_format,
    )?;

    if let Err(e) = settings.validate() {
        error!(error = %e, "Invalid configuration");
        anyhow::bail!("Invalid configuration: {}", e);
    }

    info!(
        data_dir = %settings.storage.data_dir.display(),
        configured_sites = settings.sites.len(),
        "Configuration loaded"
    );

    if let Some(port) = settings.observability.metrics_port {
        init_metrics(port)?;
    }

    let site_watch = init_site_watch(&settings, Arc::new(LogTransport)).await;
    if let Some(warning) = site_watch.degraded_warning() {
        warn!(warning = %warning, "Starting in degraded mode");
    }

    let scheduled = site_watch
        .on_enable()
        .await
        .context("Failed to start site schedules")?;
    info!(scheduled, "Site watch scheduler running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    site_watch
        .on_disable()
        .await
        .context("Failed to stop site schedules")?;

    info!("Scheduler stopped");
    Ok(())
}
