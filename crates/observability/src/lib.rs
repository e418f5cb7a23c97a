use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Default filter for `service` when `RUST_LOG` is unset; `level` (from
/// config) replaces the `info` baseline.
fn default_filter(service_name: &str, level: Option<&str>) -> String {
    let level = level
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("info");
    format!("{service_name}={level},{level}")
}

pub fn init_tracing(
    service_name: &str,
    level: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(service_name, level)));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    Some(guard)
}

pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;
    describe_optimizer_metrics();

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

fn describe_optimizer_metrics() {
    describe_counter!("optimizer.explore.accepted", "explorations served");
    describe_counter!("optimizer.explore.declined", "requests the sampler declined");
    describe_counter!("optimizer.exploit.ok", "exploit recommendations served");
    describe_counter!("optimizer.request.error", "optimize requests answered with an error status");
    describe_counter!("optimizer.feedback.ack", "feedback matched to a pending exploration");
    describe_counter!("optimizer.feedback.miss", "feedback without a pending exploration");
    describe_counter!("optimizer.pending.expired", "explorations settled by timeout");
    describe_counter!("optimizer.calibration.applied", "level curves replaced by a fit");
    describe_counter!("optimizer.calibration.skipped", "level fits rejected or failed");
    describe_histogram!(
        "optimizer.calibration.fit_ms",
        Unit::Milliseconds,
        "wall time of one level fit"
    );
}
