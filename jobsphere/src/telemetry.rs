// Logging and metrics bootstrap for embedding processes
//
// The runtime logs through the `tracing` facade and emits through the
// `metrics` facade; both work with whatever subscriber/recorder the
// embedding process installs. These helpers cover the common case.

use anyhow::Result;
use metrics::describe_counter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::settings::LoggingSettings;

/// Install a tracing subscriber per the settings. Call at most once per
/// process; an embedding application may install its own subscriber
/// instead.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| anyhow::anyhow!("invalid log filter: {e}"))?;

    if settings.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))?;
    }

    tracing::info!(level = %settings.level, json = settings.json, "logging initialized");
    Ok(())
}

/// Describe the metrics the runtime emits so an installed recorder exports
/// them with help text.
pub fn describe_metrics() {
    describe_counter!("trigger_fired_total", "Triggered events raised, per trigger");
    describe_counter!(
        "trigger_completed_total",
        "Trigger terminal transitions, per reason"
    );
    describe_counter!("trigger_faulted_total", "Faults raised by triggers");
    describe_counter!("orchestrator_triggered_total", "Aggregate firings observed");
    describe_counter!("job_executed_total", "Successful job executions");
    describe_counter!(
        "job_skipped_total",
        "Job executions skipped by the rate limiter"
    );
    describe_counter!("job_faulted_total", "Failed job executions");
}
