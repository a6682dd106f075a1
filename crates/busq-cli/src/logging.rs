//! Diagnostic logging on stderr.

use crate::config::LogFormat;
use crate::CliError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "logging_tests.rs"]
mod tests;

/// Directives used by `-d`
pub const DEBUG_DIRECTIVES: &str = "busq_cli=debug,busq_runtime=debug";

/// Directives used when neither `-d` nor `RUST_LOG` is given
pub const DEFAULT_DIRECTIVES: &str = "warn";

/// Pick the filter directives: `-d` wins over `RUST_LOG`, which wins over the default
pub fn filter_directives(debug: bool, rust_log: Option<&str>) -> String {
    if debug {
        return DEBUG_DIRECTIVES.to_string();
    }

    match rust_log.map(str::trim) {
        Some(directives) if !directives.is_empty() => directives.to_string(),
        _ => DEFAULT_DIRECTIVES.to_string(),
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn initialize_logging(debug: bool, format: LogFormat) -> Result<(), CliError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::try_new(filter_directives(debug, rust_log.as_deref()))
        .or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))
        .map_err(|e| CliError::Logging(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    // Already initialized, e.g. when commands run in-process from tests
    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
    Ok(())
}
