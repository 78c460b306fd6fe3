//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sync_smoke=debug,client_core=debug";

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, then `ROOMSYNC_SMOKE_LOG`, then
/// `ROOMSYNC_LOG`, then the built-in default.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for var in ["ROOMSYNC_SMOKE_LOG", "ROOMSYNC_LOG"] {
        if let Some(value) = env::var(var).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
