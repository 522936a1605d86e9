//! Logging setup shared by Garrison binaries

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Filtering comes from `RUST_LOG`, falling back to `info`. Setting
/// `GARRISON_LOG_JSON=1` switches to newline-delimited JSON for log
/// shippers; the default human-readable format is meant for terminals.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if json_logs_requested() {
        builder.json().with_current_span(false).init();
    } else {
        builder.init();
    }
}

fn json_logs_requested() -> bool {
    std::env::var("GARRISON_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}
