//! Tracing bootstrap for the smoke run.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sync_smoke=debug,sync_client=debug,sync_worker=debug";

/// Install the global subscriber.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `PIKACHAT_SYNC_LOG`
/// 3) `PIKACHAT_LOG`
/// 4) internal default filter
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

    ["PIKACHAT_SYNC_LOG", "PIKACHAT_LOG"]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
