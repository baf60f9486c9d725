//! Logging setup.
//!
//! Structured logging via `tracing`. The library only emits events; this
//! module is the binary-side initializer with level/format knobs.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Initialize the global subscriber.
///
/// `level` is the default directive; `TREEDB_LOG` overrides it with a full
/// EnvFilter expression. Calling twice is an error surfaced by the
/// subscriber, so the binary does this exactly once.
pub fn init(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_env("TREEDB_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    match format {
        LogFormat::Text => {
            Registry::default()
                .with(filter)
                .with(fmt::layer().with_target(true))
                .init();
        }
        LogFormat::Json => {
            Registry::default()
                .with(filter)
                .with(fmt::layer().json().with_target(true))
                .init();
        }
    }
}
