//! Logging configuration.
//!
//! Log levels come from `RUST_LOG` (default `info`); the output format is
//! selected by `LOG_FORMAT` (`pretty` for development, `json` for
//! production collectors).
//!
//! ```rust,no_run
//! use barkeep::telemetry::{init_logging, LogFormat};
//!
//! init_logging(LogFormat::from_env()).expect("failed to init logging");
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output for development.
    #[default]
    Pretty,
    /// Machine-readable JSON lines.
    Json,
}

impl LogFormat {
    /// Read the format from `LOG_FORMAT`, defaulting to pretty.
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") | Ok("JSON") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Safe to call once per process; a second call returns an error from the
/// underlying registry rather than panicking, so tests can race it.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
    }

    Ok(())
}
