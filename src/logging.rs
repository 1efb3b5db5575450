use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogFormat;

/// Initialize tracing on stdout.
///
/// - Pretty: compact, human-readable for an operator's terminal
/// - Json: one object per line for cron logs shipped to an aggregator
/// - Default level: INFO, override via RUST_LOG env
pub fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,certificate_vault=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    // A subscriber is already installed when embedded in a host process.
    if result.is_ok() {
        tracing::debug!("Tracing initialized");
    }
}
