//! Logging setup using `tracing` + `tracing-subscriber`.

use tracing_subscriber::EnvFilter;

/// Default filter directive when neither `RUST_LOG` nor a level is given.
pub const DEFAULT_DIRECTIVE: &str = "taskd=info";

/// Build the filter: `--log-level` wins, then `RUST_LOG`, then the default.
pub fn env_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(format!("taskd={level},taskd_dispatcher={level},taskd_proto={level}")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{DEFAULT_DIRECTIVE},taskd_dispatcher=info,taskd_proto=info"))
        }),
    }
}

/// Initialise the global subscriber, logging to stderr.
pub fn init_logging(level: Option<&str>) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
