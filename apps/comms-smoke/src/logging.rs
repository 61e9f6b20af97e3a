//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str =
    "info,comms_smoke=debug,comms_core=debug,comms_inworld=debug,comms_federated=debug";

/// Install the global subscriber.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `COMMS_SMOKE_LOG`
/// 3) `COMMS_LOG`
/// 4) built-in default
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
    ["COMMS_SMOKE_LOG", "COMMS_LOG"]
        .into_iter()
        .find_map(|key| filter_from_var(key))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn filter_from_var(key: &str) -> Option<EnvFilter> {
    let value = env::var(key).ok().filter(|v| !v.trim().is_empty())?;
    EnvFilter::try_new(value).ok()
}
