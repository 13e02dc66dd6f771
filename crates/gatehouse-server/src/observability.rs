//! Tracing setup.
//!
//! The filter sits behind a reload layer so the level from the loaded
//! configuration can be applied after tracing is already running.
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

/// Directives for a configured level. HTTP client internals stay at `warn`
/// unless tracing everything.
fn directives(level: &str) -> String {
    let level = level.to_ascii_lowercase();
    if level == "trace" {
        return level;
    }
    format!("{level},hyper_util=warn,reqwest=warn")
}

/// Installs the global subscriber. `RUST_LOG`, when set and valid, wins over
/// `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(level)));

    let (reload_layer, handle) = reload::Layer::new(filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer())
        .try_init();
}

/// Applies the configured logging level unless `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let _ = handle.modify(|f| {
            *f = EnvFilter::new(directives(level));
        });
    }
}
