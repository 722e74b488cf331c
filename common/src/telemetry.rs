// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over `log_level`. `log_format` is `json`
/// (default) or `pretty`. Calling this twice returns an error.
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = match log_format {
        "pretty" => fmt::layer()
            .pretty()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
        _ => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level, log_format, "Structured logging initialized");
    Ok(())
}

/// Initialize the Prometheus metrics exporter and describe every metric
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("site_ticks_total", "Completed site ticks by outcome");
    describe_counter!("site_fetch_failures_total", "Failed site fetches");
    describe_counter!(
        "notifications_delivered_total",
        "Change notifications delivered to a subscriber"
    );
    describe_counter!(
        "notifications_failed_total",
        "Change notifications that could not be delivered"
    );
    describe_counter!(
        "notifications_deduplicated_total",
        "Change events skipped because the message was already sent"
    );
    describe_gauge!("scheduled_sites", "Sites with a running schedule");
    describe_histogram!(
        "site_fetch_duration_seconds",
        "Duration of site fetches in seconds"
    );

    tracing::info!(
        metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );
    Ok(())
}

#[inline]
pub fn record_tick(site: &str, outcome: &'static str) {
    counter!("site_ticks_total", "site" => site.to_string(), "outcome" => outcome).increment(1);
}

#[inline]
pub fn record_fetch_failure(site: &str) {
    counter!("site_fetch_failures_total", "site" => site.to_string()).increment(1);
}

#[inline]
pub fn record_fetch_duration(site: &str, duration_seconds: f64) {
    histogram!("site_fetch_duration_seconds", "site" => site.to_string()).record(duration_seconds);
}

#[inline]
pub fn record_notification_delivered(site: &str) {
    counter!("notifications_delivered_total", "site" => site.to_string()).increment(1);
}

#[inline]
pub fn record_notification_failed(site: &str) {
    counter!("notifications_failed_total", "site" => site.to_string()).increment(1);
}

#[inline]
pub fn record_notification_deduplicated(site: &str) {
    counter!("notifications_deduplicated_total", "site" => site.to_string()).increment(1);
}

#[inline]
pub fn update_scheduled_sites(count: usize) {
    gauge!("scheduled_sites").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_does_not_panic() {
        let first = init_logging("info", "json");
        let second = init_logging("debug", "pretty");
        // At most one global subscriber can be installed per process
        assert!(first.is_err() || second.is_err());
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        record_tick("demo", "changed");
        record_fetch_failure("demo");
        record_fetch_duration("demo", 0.25);
        record_notification_delivered("demo");
        record_notification_failed("demo");
        record_notification_deduplicated("demo");
        update_scheduled_sites(3);
    }
}
