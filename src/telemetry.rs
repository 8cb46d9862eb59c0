//! Logging setup.
//!
//! `RUST_LOG` controls levels (default `info`). Logs go to stderr so command
//! output on stdout stays machine-readable.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Fmt,
    /// One JSON object per event.
    Json,
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing(format: LogFormat) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        // try_init: a test harness may already have installed a subscriber.
        let result = match format {
            LogFormat::Fmt => registry
                .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
                .try_init(),
            LogFormat::Json => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
        };
        if let Err(e) = result {
            eprintln!("Logging already initialized: {}", e);
        }
    });
}
