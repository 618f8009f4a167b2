use crate::config::ObservabilityConfig;
use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initialize tracing for the process.
///
/// `RUST_LOG` wins over the configured level. Output goes to stderr so
/// command output on stdout stays clean.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("Invalid log level '{}'", config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    tracing::debug!("telemetry initialized");
    Ok(())
}

/// Generate a correlation ID linking the log lines of one sync attempt
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn create_sync_span(branch: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "upstream_sync",
        branch = branch,
        correlation.id = correlation_id,
    )
}
