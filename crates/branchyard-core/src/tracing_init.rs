//! Shared tracing/logging initialization.
//!
//! The daemon binary and the integration harnesses set up `tracing_subscriber`
//! the same way: an env-filter plus either human-readable or JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- filter used when `RUST_LOG` is not set
///   (e.g. `"branchyard_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = build_filter(default_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Build the daemon's default filter string from a bare level such as `"debug"`.
///
/// Both crates are included so core parse warnings show up next to daemon logs.
pub fn default_filter(level: &str) -> String {
    format!("branchyard_daemon={level},branchyard_core={level}")
}

fn build_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_both_crates() {
        let filter = default_filter("debug");
        assert_eq!(filter, "branchyard_daemon=debug,branchyard_core=debug");
    }
}
