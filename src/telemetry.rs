use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initialize structured logging. `RUST_LOG` wins over `log_level` when set.
/// Logs go to stderr so command output on stdout stays clean.
pub fn init_telemetry(log_level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    if json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    }

    tracing::debug!(json, "Telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one orchestrator run (discover, analyze or drain)
pub fn create_run_span(command: &str, run_id: &str) -> tracing::Span {
    tracing::info_span!(
        "merge_conductor_run",
        command = command,
        correlation.id = run_id,
    )
}

/// Span covering one merge operation
pub fn create_merge_span(operation_id: &str, change_request: &str) -> tracing::Span {
    tracing::info_span!(
        "merge_operation",
        operation.id = operation_id,
        change_request = change_request,
    )
}
