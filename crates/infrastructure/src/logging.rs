use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigError, LogFormat, LogLevel};

/// Initialize structured logging to stderr. Stdout carries verdicts.
///
/// - `LogFormat::Json`: flattened JSON, one event per line.
/// - `LogFormat::Text`: human-readable colored output.
///
/// `RUST_LOG` takes precedence over `level`. Fails if a global subscriber
/// is already installed.
pub fn init_logging(level: LogLevel, format: LogFormat) -> Result<(), ConfigError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    installed.map_err(|e| ConfigError::Validation {
        field: "agent.log_format".to_string(),
        message: format!("cannot install log subscriber: {e}"),
    })
}
