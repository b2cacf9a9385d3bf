use tracing_subscriber::fmt::time::UtcTime;

/// Environment variable that overrides the default log filter.
pub const LOG_FILTER_ENV: &str = "SWITCHBOARD_LOG";

const DEFAULT_FILTER: &str = "switchboard=info,sqlx=warn";

/// Install the tracing subscriber: JSON lines on stderr with UTC timestamps.
///
/// Safe to call more than once; later calls are no-ops. The `log` bridge is
/// installed first so sqlx's `log` records flow through the same filter.
pub fn init() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var(LOG_FILTER_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .try_init();
}
