//! Logging infrastructure for kiln.
//!
//! Every component logs through `tracing`; this module wires the global
//! subscriber. Verbosity comes from `RUST_LOG` when set, otherwise from the
//! `DEBUG` / `LOG_LEVEL` environment variables.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init();
}

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    if let Ok(debug) = std::env::var("DEBUG") {
        if debug != "0" {
            return EnvFilter::new("debug");
        }
    }
    match std::env::var("LOG_LEVEL").ok().as_deref() {
        Some("trace") => EnvFilter::new("trace"),
        Some("debug") => EnvFilter::new("debug"),
        Some("warn") => EnvFilter::new("warn"),
        Some("error") => EnvFilter::new("error"),
        _ => EnvFilter::new("info"),
    }
}
