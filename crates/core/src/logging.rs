//! Logging and observability
//!
//! Structured logging via `tracing`. Every component in this crate instruments
//! its public entry points with spans (one per port build, one per phase, one
//! per mount operation) so a single `RUST_LOG` filter can zoom into exactly the
//! part of the pipeline under investigation.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Initialize the logging system with the default (text) format.
pub fn init() -> anyhow::Result<()> {
    init_with_format(LogFormat::Text)
}

/// Initialize the logging system, selecting human-readable or JSON output.
///
/// Safe to call more than once per process (a second call is a no-op) since
/// the worker-helper re-invocation path (`--worker-helper`) shares the same
/// binary and initializes logging independently of the parent.
pub fn init_with_format(format: LogFormat) -> anyhow::Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
    }

    tracing::debug!(?format, "logging initialized");
    Ok(())
}
