//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by trainforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all trainforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Position of the service in its readiness sequence (0 = NO_RUNTIME).
pub static READINESS_STATE: OnceLock<Gauge> = OnceLock::new();

/// Number of projects per training status.
pub static TRAINING_PROJECTS: OnceLock<GaugeVec> = OnceLock::new();

/// Completed pipeline runs, labeled by pipeline and outcome.
pub static PIPELINE_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Step duration in seconds, labeled by pipeline and step.
pub static STEP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again leaves the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let readiness_state = Gauge::new(
        "trainforge_readiness_state",
        "Position of the service in its readiness sequence",
    )?;

    let training_projects = GaugeVec::new(
        Opts::new("trainforge_training_projects", "Number of projects per training status"),
        &["status"],
    )?;

    let pipeline_runs_total = CounterVec::new(
        Opts::new("trainforge_pipeline_runs_total", "Total pipeline runs"),
        &["pipeline", "outcome"],
    )?;

    // Training steps run for hours; the top buckets cover that.
    let step_duration = HistogramVec::new(
        HistogramOpts::new(
            "trainforge_step_duration_seconds",
            "Pipeline step duration in seconds",
        )
        .buckets(vec![0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 7200.0, 43200.0]),
        &["pipeline", "step"],
    )?;

    registry.register(Box::new(readiness_state.clone()))?;
    registry.register(Box::new(training_projects.clone()))?;
    registry.register(Box::new(pipeline_runs_total.clone()))?;
    registry.register(Box::new(step_duration.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = READINESS_STATE.set(readiness_state);
    let _ = TRAINING_PROJECTS.set(training_projects);
    let _ = PIPELINE_RUNS_TOTAL.set(pipeline_runs_total);
    let _ = STEP_DURATION.set(step_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
