//! Prometheus metrics

use crate::error::LoadFailure;
use crate::sampler::Stability;
use crate::search::Termination;
use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::Path;
use std::time::Duration;

/// Setup Prometheus metrics recorder
/// Returns a handle that can be used to render the collected metrics
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::debug!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Write the current metrics in Prometheus text format
pub fn write_snapshot(handle: &PrometheusHandle, path: &Path) -> Result<()> {
    std::fs::write(path, handle.render())
        .with_context(|| format!("Failed to write metrics to {:?}", path))?;
    tracing::info!(path = ?path, "Metrics written");
    Ok(())
}

/// Record a load request sent to the daemon
pub fn record_load_attempt(model: &str) {
    metrics::counter!("ctx_probe_load_attempts_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a failed load
pub fn record_load_failure(model: &str, reason: LoadFailure) {
    metrics::counter!("ctx_probe_load_failures_total",
        "model" => model.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_load_duration(elapsed: Duration) {
    metrics::histogram!("ctx_probe_load_duration_seconds").record(elapsed.as_secs_f64());
}

/// Record an unload the daemon did not confirm
pub fn record_unload_failure(model: &str) {
    metrics::counter!("ctx_probe_unload_failures_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a sampler result by stability
pub fn record_sample(stability: Stability) {
    let label = match stability {
        Stability::Stable => "stable",
        Stability::Provisional => "provisional",
    };
    metrics::counter!("ctx_probe_samples_total", "stability" => label).increment(1);
}

/// Record the load cycles spent on one model's search
pub fn record_search(model: &str, probes: usize, termination: Termination) {
    let label = match termination {
        Termination::DeclaredMaxFits => "declared_max_fits",
        Termination::Converged => "converged",
        Termination::IterationCap => "iteration_cap",
        Termination::NothingFits => "nothing_fits",
        Termination::Abandoned => "abandoned",
    };
    metrics::histogram!("ctx_probe_search_load_cycles",
        "model" => model.to_string(),
        "termination" => label
    )
    .record(probes as f64);
}
