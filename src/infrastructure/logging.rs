//! Logging configuration
//!
//! Initializes tracing for the application. `RUST_LOG` takes precedence over
//! the configured level.

/// Initializes logging with the specified level
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
